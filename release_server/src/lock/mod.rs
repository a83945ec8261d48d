//! Named, time-bounded mutual-exclusion locks.
//!
//! A lock is a lease: whoever holds it may proceed until it is released or its
//! TTL runs out, after which any contender may take it over. Commit binding
//! takes one lease per release so concurrent submissions for the same release
//! are serialized across processes.
//!
//! # Example
//!
//! ```rust,ignore
//! let lease = acquire_with_retry(&locks, "releasecommits:1:42", ttl, &RetryPolicy::default()).await?;
//! // ... critical section ...
//! locks.release(&lease).await?;
//! ```

pub mod memory;
pub mod pg;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

pub use memory::InMemoryLockManager;
pub use pg::PgLockManager;

/// Default lease duration for commit binding.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

/// Default number of acquisition attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

const BACKOFF_BASE: Duration = Duration::from_millis(50);

const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub holder_id: String,
    /// Identifies this acquisition; release only succeeds with a matching token.
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {key} is held by another holder after {attempts} attempt(s)")]
    Busy { key: String, attempts: u32 },

    #[error("lock storage error: {0}")]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// One acquisition attempt. `None` when another holder has an unexpired lease.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError>;

    /// Releases the lease if it is still ours. `false` when it already expired
    /// or was taken over.
    async fn release(&self, lease: &LockLease) -> Result<bool, LockError>;

    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;
}

/// Exponential backoff schedule for blocking acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: BACKOFF_BASE,
            max_delay: BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, counting from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Acquires `key`, retrying with exponential backoff while it is held.
///
/// # Errors
///
/// `LockError::Busy` once the attempts are exhausted; storage failures are
/// returned immediately.
pub async fn acquire_with_retry(
    locks: &dyn LockManager,
    key: &str,
    ttl: Duration,
    policy: &RetryPolicy,
) -> Result<LockLease, LockError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        if let Some(lease) = locks.try_acquire(key, ttl).await? {
            return Ok(lease);
        }
        if attempts >= policy.max_attempts {
            return Err(LockError::Busy {
                key: key.to_string(),
                attempts,
            });
        }
        let delay = policy.delay_after(attempts);
        tracing::debug!(key, attempts, delay_ms = delay.as_millis() as u64, "Lock held, backing off");
        tokio::time::sleep(delay).await;
    }
}

fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(2), Duration::from_millis(100));
        assert_eq!(policy.delay_after(4), Duration::from_millis(400));
        assert_eq!(policy.delay_after(6), Duration::from_secs(1));
        assert_eq!(policy.delay_after(40), Duration::from_secs(1));
    }

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_is_busy() -> Result<(), LockError> {
        let locks = InMemoryLockManager::new();
        let _held = locks.try_acquire("k", Duration::from_secs(60)).await?;

        let err = acquire_with_retry(&locks, "k", DEFAULT_LOCK_TTL, &RetryPolicy::with_max_attempts(3))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy { attempts: 3, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn acquires_free_lock_first_try() -> Result<(), LockError> {
        let locks = InMemoryLockManager::new();
        let lease = acquire_with_retry(&locks, "k", DEFAULT_LOCK_TTL, &RetryPolicy::default()).await?;
        assert_eq!(lease.key, "k");
        assert!(locks.is_locked("k").await?);
        assert!(locks.release(&lease).await?);
        assert!(!locks.is_locked("k").await?);
        Ok(())
    }
}
