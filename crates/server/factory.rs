//! Builds the queue, store and session provider selected by configuration.

use std::sync::Arc;

use drover_core::{
    NoopSessions, ProcessQueue, Result, SharedQueue, SharedSessionProvider, SharedStore,
};
use drover_redis::{RedisQueue, RedisStore};
use drover_sqlite::SqliteSessions;

use crate::config::{QueueKind, ServerConfig};

/// Selects a [`JobQueue`](drover_core::JobQueue) implementation from
/// configuration.
pub struct QueueFactory;

impl QueueFactory {
    /// Connect the external store, if a Redis URL is configured.
    pub async fn store(config: &ServerConfig) -> Result<Option<SharedStore>> {
        match &config.redis_url {
            Some(url) => {
                let store = RedisStore::new(url).await?;
                tracing::info!("Using Redis for locks and job ownership");
                Ok(Some(SharedStore::new(store)))
            }
            None => {
                tracing::info!("No external store configured, running single-node");
                Ok(None)
            }
        }
    }

    /// Session provider for job processes.
    pub fn sessions(config: &ServerConfig) -> SharedSessionProvider {
        match &config.database_url {
            Some(url) => Arc::new(SqliteSessions::new(url.clone(), config.namespace.clone())),
            None => Arc::new(NoopSessions),
        }
    }

    /// Create the configured queue.
    pub async fn create(
        config: &ServerConfig,
        store: Option<SharedStore>,
        sessions: SharedSessionProvider,
    ) -> Result<SharedQueue> {
        match (config.queue, &config.redis_url) {
            (QueueKind::Redis, Some(url)) => {
                tracing::info!(namespace = %config.namespace, "Using Redis broker queue");
                Ok(Arc::new(RedisQueue::new(url, &config.namespace).await?))
            }
            (QueueKind::Redis, None) => Err(drover_core::DroverError::Config(
                "redis queue requires a Redis URL".to_string(),
            )),
            (QueueKind::Process, _) => {
                tracing::info!(
                    namespace = %config.namespace,
                    concurrency = config.concurrency,
                    "Using process queue"
                );
                Ok(Arc::new(
                    ProcessQueue::builder()
                        .config(config.queue_config())
                        .shared_store(store)
                        .shared_sessions(sessions)
                        .build(),
                ))
            }
        }
    }
}
