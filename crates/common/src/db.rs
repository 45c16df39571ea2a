//! SQLite database for Meshplane account persistence
//!
//! Each account is stored as one JSON document. Writes replace the whole
//! document and bump its generation, so a save is atomic for the account.

use crate::types::Account;
use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                serial INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                generation INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )?;

        Ok(())
    }

    /// Insert or replace an account document
    pub fn save_account(&self, account: &Account) -> Result<()> {
        let document = serde_json::to_string(account)?;
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO accounts (id, document, serial, created_at, updated_at, generation)
            VALUES (?1, ?2, ?3, ?4, ?4, 1)
            ON CONFLICT(id) DO UPDATE SET
                document = excluded.document,
                serial = excluded.serial,
                updated_at = excluded.updated_at,
                generation = accounts.generation + 1
            "#,
            params![account.id, document, account.network.serial as i64, now],
        )?;

        debug!("Saved account {} at serial {}", account.id, account.network.serial);
        Ok(())
    }

    /// Load an account document
    pub fn load_account(&self, id: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();

        let document: Option<String> = conn
            .query_row(
                "SELECT document FROM accounts WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match document {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// Number of times an account has been written
    pub fn account_generation(&self, id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let generation = conn
            .query_row(
                "SELECT generation FROM accounts WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(generation)
    }

    /// List stored account IDs
    pub fn list_account_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM accounts ORDER BY created_at ASC, id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Delete an account
    pub fn delete_account(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;

        if rows > 0 {
            debug!("Deleted account {}", id);
        }

        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Group;

    #[test]
    fn test_account_crud() {
        let db = Database::open_memory().unwrap();
        let mut account = Account::new("acc-1", "owner", "example.com");

        db.save_account(&account).unwrap();
        assert_eq!(db.account_generation("acc-1").unwrap(), Some(1));

        account.groups.insert("g1".to_string(), Group::new("g1", "Engineering"));
        account.bump_serial();
        db.save_account(&account).unwrap();
        assert_eq!(db.account_generation("acc-1").unwrap(), Some(2));

        let loaded = db.load_account("acc-1").unwrap().unwrap();
        assert_eq!(loaded.network.serial, 1);
        assert!(loaded.groups.contains_key("g1"));

        assert_eq!(db.list_account_ids().unwrap(), vec!["acc-1".to_string()]);

        assert!(db.delete_account("acc-1").unwrap());
        assert!(db.load_account("acc-1").unwrap().is_none());
        assert!(!db.delete_account("acc-1").unwrap());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let db = Database::open(&path).unwrap();
            db.save_account(&Account::new("acc-1", "owner", "example.com"))
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert!(db.load_account("acc-1").unwrap().is_some());
    }
}
