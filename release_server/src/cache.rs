//! Advisory TTL cache for release lookups.
//!
//! Entries only save a query; every path still works when the cache is empty
//! or stale.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::models::release::Release;

/// A cached lookup result. `Missing` records a lookup that found nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedRelease {
    Found(Release),
    Missing,
}

#[async_trait]
pub trait ReleaseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedRelease>;
    async fn set(&self, key: &str, value: CachedRelease, ttl: Duration);
    async fn expire(&self, key: &str);
}

/// `release:3:{organization_id}:{digest}`, the digest being the first 16 hex
/// characters of the version's SHA-256.
pub fn release_cache_key(organization_id: i64, version: &str) -> String {
    let digest = hex::encode(Sha256::digest(version.as_bytes()));
    format!("release:3:{organization_id}:{}", &digest[..16])
}

#[derive(Debug, Default)]
pub struct InMemoryReleaseCache {
    entries: RwLock<HashMap<String, (CachedRelease, Instant)>>,
}

impl InMemoryReleaseCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.values().filter(|(_, expires)| *expires > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReleaseCache for InMemoryReleaseCache {
    async fn get(&self, key: &str) -> Option<CachedRelease> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }

    async fn set(&self, key: &str, value: CachedRelease, ttl: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (value, now + ttl));
    }

    async fn expire(&self, key: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_scoped_and_hashed() {
        let key = release_cache_key(7, "1.0.0");
        assert!(key.starts_with("release:3:7:"));
        assert_eq!(key.len(), "release:3:7:".len() + 16);
        assert_ne!(key, release_cache_key(8, "1.0.0"));
        assert_ne!(key, release_cache_key(7, "1.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = InMemoryReleaseCache::new();
        cache.set("k", CachedRelease::Missing, Duration::from_secs(300)).await;
        assert_eq!(cache.get("k").await, Some(CachedRelease::Missing));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn expire_removes_entry() {
        let cache = InMemoryReleaseCache::new();
        cache.set("k", CachedRelease::Missing, Duration::from_secs(60)).await;
        cache.expire("k").await;
        assert_eq!(cache.get("k").await, None);
    }
}
