//! Redis backend for drover.
//!
//! This crate provides:
//! - [`RedisStore`], a [`KvStore`] used for distributed locks and cross-replica
//!   job ownership
//! - [`RedisQueue`], a broker-based [`JobQueue`](drover_core::JobQueue) whose
//!   jobs are executed by one or more [`RedisConsumer`] processes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use drover_core::{DistributedLock, SharedStore};
//! use drover_redis::RedisStore;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> drover_core::Result<()> {
//!     let store = RedisStore::new("redis://localhost").await?;
//!     let lock = DistributedLock::new(Some(SharedStore::new(store)));
//!     if lock.try_acquire("scheduler_tick", Duration::from_secs(60)).await {
//!         // critical section
//!         lock.release("scheduler_tick").await?;
//!     }
//!     Ok(())
//! }
//! ```

mod queue;

pub use queue::{JobRecord, RedisConsumer, RedisConsumerBuilder, RedisQueue};

use async_trait::async_trait;
use drover_core::{DroverError, KvStore, Result, StoreKeys};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Manages broker keys with a namespace prefix.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    namespace: String,
    store: StoreKeys,
}

/// Table prefix for all drover broker keys.
const DROVER_TABLE_PREFIX: &str = "_drover_tb_";

impl RedisKeys {
    /// Create a new RedisKeys instance with the given namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            store: StoreKeys::new(namespace.clone()),
            namespace,
        }
    }

    /// Get the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key for the main jobs queue (LIST).
    pub fn jobs(&self) -> String {
        format!("{}{}:jobs", DROVER_TABLE_PREFIX, self.namespace)
    }

    /// Key for the set of job ids with a status record (SET).
    pub fn known(&self) -> String {
        format!("{}{}:known", DROVER_TABLE_PREFIX, self.namespace)
    }

    /// Key for a job's status record (STRING, JSON).
    pub fn status(&self, job_id: &str) -> String {
        format!("{}{}:status:{}", DROVER_TABLE_PREFIX, self.namespace, job_id)
    }

    /// Prefix of consumer liveness keys; the identity is appended.
    pub fn client_prefix(&self) -> String {
        self.store.client("")
    }

    /// Key layout shared with [`Ownership`](drover_core::Ownership).
    pub fn store_keys(&self) -> &StoreKeys {
        &self.store
    }
}

/// [`KvStore`] on Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| DroverError::Store(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Create a store with an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// The underlying connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("etl");
        assert_eq!(keys.namespace(), "etl");
        assert_eq!(keys.jobs(), "_drover_tb_etl:jobs");
        assert_eq!(keys.known(), "_drover_tb_etl:known");
        assert_eq!(keys.status("block_run_42"), "_drover_tb_etl:status:block_run_42");
    }

    #[test]
    fn test_client_prefix_matches_store_keys() {
        let keys = RedisKeys::new("etl");
        let identity = "host-1234";
        assert_eq!(
            format!("{}{}", keys.client_prefix(), identity),
            keys.store_keys().client(identity)
        );
    }

    #[test]
    fn test_redis_keys_complex_namespace() {
        let keys = RedisKeys::new("team:prod");
        assert_eq!(keys.jobs(), "_drover_tb_team:prod:jobs");
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }
}

// ========== Integration Tests (require Redis) ==========
