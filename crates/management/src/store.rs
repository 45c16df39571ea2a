//! Account storage collaborators
//!
//! The manager only needs whole-account load and save. Both are assumed
//! atomic for the duration of one manager call.

use async_trait::async_trait;
use meshplane_common::{Account, Database, Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Storage interface consumed by the account manager
#[async_trait]
pub trait Store: Send + Sync {
    /// Load a snapshot of the account
    async fn load_account(&self, account_id: &str) -> Result<Account>;

    /// Persist the whole account
    async fn save_account(&self, account: &Account) -> Result<()>;

    /// Whether the account exists
    async fn account_exists(&self, account_id: &str) -> Result<bool>;
}

// ============================================================================
// SQLite
// ============================================================================

/// Store backed by the shared SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_account(&self, account_id: &str) -> Result<Account> {
        self.db
            .load_account(account_id)?
            .ok_or_else(|| Error::not_found("account", account_id))
    }

    async fn save_account(&self, account: &Account) -> Result<()> {
        self.db.save_account(account)
    }

    async fn account_exists(&self, account_id: &str) -> Result<bool> {
        Ok(self.db.account_generation(account_id)?.is_some())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Store keeping accounts in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    accounts: Arc<RwLock<HashMap<String, Account>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_account(&self, account_id: &str) -> Result<Account> {
        self.accounts
            .read()
            .get(account_id)
            .cloned()
            .ok_or_else(|| Error::not_found("account", account_id))
    }

    async fn save_account(&self, account: &Account) -> Result<()> {
        debug!("Saved account {} at serial {}", account.id, account.network.serial);
        self.accounts
            .write()
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn account_exists(&self, account_id: &str) -> Result<bool> {
        Ok(self.accounts.read().contains_key(account_id))
    }
}
