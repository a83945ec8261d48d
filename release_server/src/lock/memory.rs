//! In-process lock manager for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{lease_expiry, LockError, LockLease, LockManager};
use crate::error::StoreError;

fn poison_err<T>(_: PoisonError<T>) -> LockError {
    LockError::Store(StoreError::Poisoned)
}

#[derive(Debug)]
pub struct InMemoryLockManager {
    leases: RwLock<HashMap<String, LockLease>>,
    holder_id: String,
}

impl Default for InMemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            holder_id: format!("memory-{}", Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Utc::now();

        if leases.get(key).is_some_and(|lease| lease.expires_at > now) {
            return Ok(None);
        }

        let lease = LockLease {
            key: key.to_string(),
            holder_id: self.holder_id.clone(),
            token: Uuid::new_v4(),
            expires_at: lease_expiry(now, ttl),
        };
        leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let ours = leases
            .get(&lease.key)
            .is_some_and(|current| current.token == lease.token);
        if ours {
            leases.remove(&lease.key);
        }
        Ok(ours)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let leases = self.leases.read().map_err(poison_err)?;
        let now = Utc::now();
        Ok(leases.get(key).is_some_and(|lease| lease.expires_at > now))
    }
}
