//! Server configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use drover_core::{
    parse_concurrency, DroverError, QueueConfig, Result, DEFAULT_AUTO_RESTART_INTERVAL,
    DEFAULT_CONCURRENCY,
};

/// Which [`JobQueue`](drover_core::JobQueue) implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueKind {
    /// Jobs run as child processes of the enqueuing process.
    #[default]
    Process,
    /// Jobs are published to Redis and run by `drover consume`.
    Redis,
}

impl FromStr for QueueKind {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(QueueKind::Process),
            "redis" => Ok(QueueKind::Redis),
            other => Err(DroverError::Config(format!(
                "unknown queue kind '{}', expected 'process' or 'redis'",
                other
            ))),
        }
    }
}

/// Configuration for the drover entry point.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Namespace prefix for keys/tables.
    pub namespace: String,
    /// Maximum number of simultaneously running jobs.
    pub concurrency: usize,
    /// Queue implementation.
    pub queue: QueueKind,
    /// Redis URL; enables distributed locks and ownership tracking.
    pub redis_url: Option<String>,
    /// SQLite URL; enables per-job sessions and migrations.
    pub database_url: Option<String>,
    /// Interval of the scheduler tick loop.
    pub scheduler_interval: Duration,
    /// Health check cadence of `drover supervise`.
    pub auto_restart_interval: Duration,
    /// JSON file listing the jobs each scheduler tick enqueues.
    pub schedule_file: Option<PathBuf>,
    /// TTL of the scheduler tick lock.
    pub lock_ttl: Duration,
    /// Graceful shutdown timeout.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            namespace: "drover".to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            queue: QueueKind::Process,
            redis_url: None,
            database_url: None,
            scheduler_interval: Duration::from_secs(10),
            auto_restart_interval: DEFAULT_AUTO_RESTART_INTERVAL,
            schedule_file: None,
            lock_ttl: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Create a new builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Read the configuration from `DROVER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let queue = match non_empty("DROVER_QUEUE") {
            Some(kind) => kind.parse()?,
            None => QueueKind::Process,
        };
        let redis_url = non_empty("DROVER_REDIS_URL");
        if queue == QueueKind::Redis && redis_url.is_none() {
            return Err(DroverError::Config(
                "DROVER_QUEUE=redis requires DROVER_REDIS_URL".to_string(),
            ));
        }

        Ok(Self {
            namespace: non_empty("DROVER_NAMESPACE").unwrap_or(defaults.namespace),
            concurrency: parse_concurrency(non_empty("DROVER_CONCURRENCY").as_deref()),
            queue,
            redis_url,
            database_url: non_empty("DROVER_DATABASE_URL"),
            scheduler_interval: duration_var(
                non_empty("DROVER_SCHEDULER_INTERVAL_SECS"),
                "DROVER_SCHEDULER_INTERVAL_SECS",
                Duration::from_secs,
                defaults.scheduler_interval,
            ),
            auto_restart_interval: duration_var(
                non_empty("SCHEDULER_AUTO_RESTART_INTERVAL"),
                "SCHEDULER_AUTO_RESTART_INTERVAL",
                Duration::from_millis,
                defaults.auto_restart_interval,
            ),
            schedule_file: non_empty("DROVER_SCHEDULE_FILE").map(PathBuf::from),
            lock_ttl: defaults.lock_ttl,
            shutdown_timeout: defaults.shutdown_timeout,
        })
    }

    /// Queue configuration derived from this server configuration.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::builder()
            .namespace(self.namespace.clone())
            .concurrency(self.concurrency)
            .shutdown_timeout(self.shutdown_timeout)
            .build()
    }
}

fn duration_var(
    raw: Option<String>,
    name: &str,
    unit: fn(u64) -> Duration,
    default: Duration,
) -> Duration {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => unit(n),
        _ => {
            tracing::warn!(
                variable = name,
                value = %raw,
                default_ms = default.as_millis() as u64,
                "Invalid interval, using default"
            );
            default
        }
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the worker pool size.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Set the queue implementation.
    pub fn queue(mut self, queue: QueueKind) -> Self {
        self.config.queue = queue;
        self
    }

    /// Set the Redis URL.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = Some(url.into());
        self
    }

    /// Set the SQLite URL.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = Some(url.into());
        self
    }

    /// Set the scheduler tick interval.
    pub fn scheduler_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler_interval = interval;
        self
    }

    /// Set the supervisor health check cadence.
    pub fn auto_restart_interval(mut self, interval: Duration) -> Self {
        self.config.auto_restart_interval = interval;
        self
    }

    /// Set the schedule file.
    pub fn schedule_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.schedule_file = Some(path.into());
        self
    }

    /// Set the scheduler tick lock TTL.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.config.lock_ttl = ttl;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the ServerConfig.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.namespace, "drover");
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.queue, QueueKind::Process);
        assert_eq!(config.auto_restart_interval, Duration::from_millis(10_000));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_from_empty_env_uses_defaults() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.namespace, "drover");
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.scheduler_interval, Duration::from_secs(10));
        assert!(config.schedule_file.is_none());
    }

    #[test]
    fn test_from_env_values() {
        let config = from_vars(&[
            ("DROVER_NAMESPACE", "etl"),
            ("DROVER_CONCURRENCY", "6"),
            ("DROVER_QUEUE", "redis"),
            ("DROVER_REDIS_URL", "redis://cache:6379"),
            ("DROVER_DATABASE_URL", "sqlite:drover.db"),
            ("DROVER_SCHEDULER_INTERVAL_SECS", "5"),
            ("SCHEDULER_AUTO_RESTART_INTERVAL", "2500"),
            ("DROVER_SCHEDULE_FILE", "/etc/drover/schedule.json"),
        ])
        .unwrap();

        assert_eq!(config.namespace, "etl");
        assert_eq!(config.concurrency, 6);
        assert_eq!(config.queue, QueueKind::Redis);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.database_url.as_deref(), Some("sqlite:drover.db"));
        assert_eq!(config.scheduler_interval, Duration::from_secs(5));
        assert_eq!(config.auto_restart_interval, Duration::from_millis(2500));
        assert_eq!(
            config.schedule_file,
            Some(PathBuf::from("/etc/drover/schedule.json"))
        );
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = from_vars(&[
            ("DROVER_CONCURRENCY", "many"),
            ("SCHEDULER_AUTO_RESTART_INTERVAL", "soon"),
            ("DROVER_SCHEDULER_INTERVAL_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.auto_restart_interval, DEFAULT_AUTO_RESTART_INTERVAL);
        assert_eq!(config.scheduler_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_redis_queue_requires_url() {
        let err = from_vars(&[("DROVER_QUEUE", "redis")]).unwrap_err();
        assert!(matches!(err, DroverError::Config(_)));
    }

    #[test]
    fn test_unknown_queue_kind() {
        assert!(from_vars(&[("DROVER_QUEUE", "celery")]).is_err());
        assert_eq!("Process".parse::<QueueKind>().unwrap(), QueueKind::Process);
    }

    #[test]
    fn test_queue_config() {
        let config = ServerConfig::builder()
            .namespace("prod")
            .concurrency(3)
            .shutdown_timeout(Duration::from_secs(5))
            .build();
        let queue = config.queue_config();
        assert_eq!(queue.namespace, "prod");
        assert_eq!(queue.concurrency, 3);
        assert_eq!(queue.shutdown_timeout, Duration::from_secs(5));
    }
}
