//! Account-scoped locking
//!
//! Each account gets its own reader/writer lock so unrelated accounts never
//! contend. Guards are owned and may be held across awaits.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Default)]
pub struct AccountLocks {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, account_id: &str) -> Arc<RwLock<()>> {
        if let Some(lock) = self.locks.get(account_id) {
            return lock.value().clone();
        }
        self.locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    /// Shared access for consistent snapshot reads
    pub async fn read(&self, account_id: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(account_id).read_owned().await
    }

    /// Exclusive access for mutations
    pub async fn write(&self, account_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(account_id).write_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
