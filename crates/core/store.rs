//! Key-value store abstraction for locks and cross-replica ownership.
//!
//! The store is optional: without one, locks are always granted and job
//! ownership is tracked only in the local registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

/// Store trait for TTL-bound keys.
///
/// Implementations must be thread-safe (Send + Sync). Every method is a
/// single round-trip; none of them block waiting for a key.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `key` to `value` with expiry `ttl`, only if the key is absent.
    ///
    /// Returns `true` iff this call created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Set `key` to `value` with expiry `ttl`, overwriting any previous value.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Get the value of `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// A type-erased store that can be shared across tasks.
pub type DynStore = Arc<dyn KvStore>;

/// Wrapper around Arc<dyn KvStore> for convenience.
#[derive(Clone)]
pub struct SharedStore {
    inner: DynStore,
}

impl SharedStore {
    /// Create a new SharedStore from any KvStore implementation.
    pub fn new<S: KvStore + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &DynStore {
        &self.inner
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl KvStore for SharedStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.inner.set_nx_ex(key, value, ttl).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}

/// Key layout for everything drover keeps in a store.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    namespace: String,
}

/// Prefix for all drover-created keys.
pub const DROVER_KEY_PREFIX: &str = "_drover_";

impl StoreKeys {
    /// Create a new key layout for the given namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Get the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Liveness key of a client identity.
    pub fn client(&self, identity: &str) -> String {
        format!("{}{}:client:{}", DROVER_KEY_PREFIX, self.namespace, identity)
    }

    /// Ownership key of a job; its value is the owning client identity.
    pub fn job_owner(&self, job_id: &str) -> String {
        format!("{}{}:job:{}", DROVER_KEY_PREFIX, self.namespace, job_id)
    }
}

/// In-process store with TTL semantics.
///
/// Useful when every queue lives on one host, and in tests. Expired keys are
/// dropped lazily on access.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
