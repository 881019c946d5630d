//! Distributed lock backed by a key-value store.
//!
//! Acquisition is a single `SET key 1 NX EX ttl`. There is no fencing token:
//! a holder whose TTL lapses while it is still working can overlap with the
//! next claimant.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::store::{KvStore, SharedStore};

/// Default prefix for lock keys.
pub const DEFAULT_LOCK_KEY_PREFIX: &str = "_drover_lock:";

/// Non-blocking, TTL-bound exclusive lock.
///
/// Without a store every acquisition succeeds, which only gives
/// single-process semantics on this host.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    store: Option<SharedStore>,
    key_prefix: String,
}

impl DistributedLock {
    /// Create a lock backed by `store` (or degraded when `None`).
    pub fn new(store: Option<SharedStore>) -> Self {
        Self {
            store,
            key_prefix: DEFAULT_LOCK_KEY_PREFIX.to_string(),
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Whether a backing store is configured.
    pub fn is_distributed(&self) -> bool {
        self.store.is_some()
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Try to acquire the lock for `key` for at most `ttl`.
    ///
    /// Returns `true` iff this call established the claim. Store errors count
    /// as "not acquired".
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> bool {
        let Some(store) = &self.store else {
            return true;
        };

        match store.set_nx_ex(&self.lock_key(key), "1", ttl).await {
            Ok(acquired) => {
                tracing::debug!(key = %key, acquired, "Lock acquisition attempted");
                acquired
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Lock store unavailable, lock not acquired");
                false
            }
        }
    }

    /// Release the lock for `key` unconditionally.
    pub async fn release(&self, key: &str) -> Result<()> {
        match &self.store {
            Some(store) => store.delete(&self.lock_key(key)).await,
            None => Ok(()),
        }
    }

    /// Run `critical_section` only if the lock is acquired, releasing it after.
    ///
    /// Returns `None` when the lock is held elsewhere.
    pub async fn with_lock<F, T>(&self, key: &str, ttl: Duration, critical_section: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if !self.try_acquire(key, ttl).await {
            tracing::debug!(key = %key, "Lock held elsewhere, skipping critical section");
            return None;
        }

        let output = critical_section.await;

        if let Err(e) = self.release(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to release lock");
        }

        Some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DroverError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct UnavailableStore;

    #[async_trait]
    impl KvStore for UnavailableStore {
        async fn set_nx_ex(&self, _: &str, _: &str, _: Duration) -> Result<bool> {
            Err(DroverError::Store("connection refused".to_string()))
        }

        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            Err(DroverError::Store("connection refused".to_string()))
        }

        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(DroverError::Store("connection refused".to_string()))
        }

        async fn delete(&self, _: &str) -> Result<()> {
            Err(DroverError::Store("connection refused".to_string()))
        }
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let store = SharedStore::new(MemoryStore::new());
        let first = DistributedLock::new(Some(store.clone()));
        let second = DistributedLock::new(Some(store));

        let (a, b) = tokio::join!(
            first.try_acquire("maintenance", TTL),
            second.try_acquire("maintenance", TTL)
        );
        assert!(a ^ b, "exactly one caller must win, got {} and {}", a, b);

        first.release("maintenance").await.unwrap();
        assert!(second.try_acquire("maintenance", TTL).await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let lock = DistributedLock::new(Some(SharedStore::new(MemoryStore::new())));
        assert!(lock.try_acquire("a", TTL).await);
        assert!(lock.try_acquire("b", TTL).await);
        assert!(!lock.try_acquire("a", TTL).await);
    }

    #[tokio::test]
    async fn test_degraded_without_store() {
        let lock = DistributedLock::new(None);
        assert!(!lock.is_distributed());
        assert!(lock.try_acquire("x", TTL).await);
        assert!(lock.try_acquire("x", TTL).await);
        lock.release("x").await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let lock = DistributedLock::new(Some(SharedStore::new(UnavailableStore)));
        assert!(!lock.try_acquire("x", TTL).await);
        assert!(lock.with_lock("x", TTL, async { 1 }).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_after_ttl() {
        let lock = DistributedLock::new(Some(SharedStore::new(MemoryStore::new())));
        assert!(lock.try_acquire("x", Duration::from_secs(2)).await);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(lock.try_acquire("x", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_with_lock_releases() {
        let lock = DistributedLock::new(Some(SharedStore::new(MemoryStore::new())))
            .with_key_prefix("test_lock:");
        let out = lock.with_lock("job", TTL, async { 42 }).await;
        assert_eq!(out, Some(42));
        assert!(lock.try_acquire("job", TTL).await);
    }
}
