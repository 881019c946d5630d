//! Configuration types for the queue and the scheduler supervisor.

use std::time::Duration;

use crate::job::JobTarget;

/// Worker pool size used when none (or a malformed one) is configured.
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Default interval between scheduler health checks in the foreground loop.
pub const DEFAULT_AUTO_RESTART_INTERVAL: Duration = Duration::from_millis(10_000);

/// Resolve a configured worker pool size.
///
/// `None` gives [`DEFAULT_CONCURRENCY`], `auto` gives the host CPU count, and
/// any value that is not a positive integer falls back to the default with a
/// warning instead of failing.
pub fn parse_concurrency(raw: Option<&str>) -> usize {
    let Some(raw) = raw.map(str::trim) else {
        return DEFAULT_CONCURRENCY;
    };

    if raw.eq_ignore_ascii_case("auto") {
        return cpu_concurrency();
    }

    match raw.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
            tracing::warn!(
                value = %raw,
                default = DEFAULT_CONCURRENCY,
                "Invalid concurrency, using default"
            );
            DEFAULT_CONCURRENCY
        }
    }
}

/// Number of CPUs available to this process.
pub fn cpu_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_CONCURRENCY)
}

/// Configuration for a [`ProcessQueue`](crate::ProcessQueue).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Namespace prefix for store keys.
    pub namespace: String,
    /// Maximum number of simultaneously running jobs.
    pub concurrency: usize,
    /// Supervisor polling interval.
    pub poll_interval: Duration,
    /// TTL of this replica's liveness key.
    pub liveness_ttl: Duration,
    /// TTL of job ownership claims.
    pub claim_ttl: Duration,
    /// How long shutdown waits for running jobs before killing them.
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "drover".to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: Duration::from_secs(1),
            liveness_ttl: Duration::from_secs(30),
            claim_ttl: Duration::from_secs(24 * 60 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Create a new builder.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::new()
    }
}

/// Builder for QueueConfig.
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the worker pool size. Zero is treated as the default.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = if concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            concurrency
        };
        self
    }

    /// Set the supervisor polling interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the liveness TTL.
    pub fn liveness_ttl(mut self, ttl: Duration) -> Self {
        self.config.liveness_ttl = ttl;
        self
    }

    /// Set the ownership claim TTL.
    pub fn claim_ttl(mut self, ttl: Duration) -> Self {
        self.config.claim_ttl = ttl;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the QueueConfig.
    pub fn build(self) -> QueueConfig {
        self.config
    }
}

/// Configuration for a [`SchedulerManager`](crate::SchedulerManager).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// The scheduler process to keep alive.
    pub command: JobTarget,
    /// Health check cadence of the foreground loop.
    pub auto_restart_interval: Duration,
    /// How long `stop` waits after SIGTERM before sending SIGKILL.
    pub stop_grace: Duration,
}

impl SchedulerConfig {
    /// Create a config that runs `command` with default intervals.
    pub fn new(command: JobTarget) -> Self {
        Self {
            command,
            auto_restart_interval: DEFAULT_AUTO_RESTART_INTERVAL,
            stop_grace: Duration::from_secs(5),
        }
    }

    /// Set the foreground health check cadence.
    pub fn auto_restart_interval(mut self, interval: Duration) -> Self {
        self.auto_restart_interval = interval;
        self
    }

    /// Set the SIGTERM grace period.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}
