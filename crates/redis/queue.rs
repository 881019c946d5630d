//! Broker-based job queue on Redis.
//!
//! [`RedisQueue`] only records and publishes jobs; [`RedisConsumer`]
//! processes pop them and run each one as a local OS process. Every status
//! write is a Lua script so the transition guards hold across replicas.

use async_trait::async_trait;
use drover_core::{
    run_scoped, spawn_target, ClientIdentity, DroverError, EnqueueOutcome, Job, JobId,
    JobOutcome, JobQueue, JobStatus, NoopSessions, Ownership, ProcessControl, QueueConfig,
    Result, SessionProvider, SharedProcessControl, SharedSessionProvider, SharedStore,
    SystemProcesses,
};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::{RedisKeys, RedisStore};

/// Status record stored per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub status: JobStatus,
    /// Identity of the consumer running the job.
    #[serde(default)]
    pub owner: Option<String>,
}

impl JobRecord {
    fn new(status: JobStatus, owner: Option<&ClientIdentity>) -> Self {
        Self {
            status,
            owner: owner.map(|o| o.as_str().to_string()),
        }
    }

    fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// A record is active while queued, or while running under a consumer whose
// liveness key still exists.
macro_rules! with_active_check {
    ($body:literal) => {
        concat!(
            r#"
            local function is_active(raw, client_prefix)
                if not raw then return false end
                local record = cjson.decode(raw)
                local state = record.status.state
                if state == 'queued' then return true end
                if state == 'running' then
                    local owner = record.owner
                    return type(owner) == 'string'
                        and redis.call('EXISTS', client_prefix .. owner) == 1
                end
                return false
            end
            "#,
            $body
        )
    };
}

fn enqueue_script() -> redis::Script {
    redis::Script::new(with_active_check!(
        r#"
        if is_active(redis.call('GET', KEYS[1]), ARGV[3]) then return 0 end
        redis.call('SET', KEYS[1], ARGV[1])
        redis.call('SADD', KEYS[3], ARGV[4])
        redis.call('LPUSH', KEYS[2], ARGV[2])
        return 1
        "#
    ))
}

fn clean_up_script() -> redis::Script {
    redis::Script::new(with_active_check!(
        r#"
        if is_active(redis.call('GET', KEYS[1]), ARGV[1]) then return 0 end
        redis.call('DEL', KEYS[1])
        redis.call('SREM', KEYS[2], ARGV[2])
        return 1
        "#
    ))
}

/// `Queued → ARGV[1]`.
fn from_queued_script() -> redis::Script {
    redis::Script::new(
        r#"
        local raw = redis.call('GET', KEYS[1])
        if not raw then return 0 end
        if cjson.decode(raw).status.state ~= 'queued' then return 0 end
        redis.call('SET', KEYS[1], ARGV[1])
        return 1
        "#,
    )
}

/// `Running{ARGV[2]} → ARGV[1]`.
fn from_running_script() -> redis::Script {
    redis::Script::new(
        r#"
        local raw = redis.call('GET', KEYS[1])
        if not raw then return 0 end
        local status = cjson.decode(raw).status
        if status.state ~= 'running' or status.pid ~= tonumber(ARGV[2]) then return 0 end
        redis.call('SET', KEYS[1], ARGV[1])
        return 1
        "#,
    )
}

/// Any non-terminal status → cancelled. Returns -1 for an unknown job.
fn cancel_script() -> redis::Script {
    redis::Script::new(
        r#"
        local raw = redis.call('GET', KEYS[1])
        if not raw then return -1 end
        local record = cjson.decode(raw)
        local state = record.status.state
        if state == 'completed' or state == 'cancelled' then return 0 end
        record.status = { state = 'cancelled' }
        redis.call('SET', KEYS[1], cjson.encode(record))
        return 1
        "#,
    )
}

async fn read_record(
    conn: &ConnectionManager,
    keys: &RedisKeys,
    job_id: &str,
) -> Result<Option<JobRecord>> {
    let mut conn = conn.clone();
    let raw: Option<String> = conn
        .get(keys.status(job_id))
        .await
        .map_err(|e| DroverError::Store(e.to_string()))?;
    raw.map(|json| serde_json::from_str(&json).map_err(DroverError::from))
        .transpose()
}

/// [`JobQueue`] that publishes jobs to a Redis list for consumers to run.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    keys: RedisKeys,
}

impl RedisQueue {
    /// Connect to Redis.
    pub async fn new(redis_url: &str, namespace: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| DroverError::Store(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;
        Ok(Self::with_connection(conn, namespace))
    }

    /// Create a queue with an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            keys: RedisKeys::new(namespace),
        }
    }

    /// Get the Redis keys manager.
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Number of jobs waiting for a consumer.
    pub async fn queue_len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.llen(self.keys.jobs())
            .await
            .map_err(|e| DroverError::Store(e.to_string()))
    }

    async fn is_client_alive(&self, owner: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(format!("{}{}", self.keys.client_prefix(), owner))
            .await
            .map_err(|e| DroverError::Store(e.to_string()))
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome> {
        let mut conn = self.conn.clone();
        let record = JobRecord::new(JobStatus::Queued, None).to_json()?;

        let enqueued: i32 = enqueue_script()
            .key(self.keys.status(job.id.as_str()))
            .key(self.keys.jobs())
            .key(self.keys.known())
            .arg(record)
            .arg(job.to_json()?)
            .arg(self.keys.client_prefix())
            .arg(job.id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;

        if enqueued == 1 {
            tracing::info!(job_id = %job.id, "Job published");
            Ok(EnqueueOutcome::Enqueued)
        } else {
            tracing::info!(job_id = %job.id, "Job already active, skipping enqueue");
            Ok(EnqueueOutcome::AlreadyActive)
        }
    }

    async fn has_job(&self, job_id: &JobId) -> bool {
        let record = match read_record(&self.conn, &self.keys, job_id.as_str()).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to read job status");
                return false;
            }
        };

        match (record.status, record.owner) {
            (JobStatus::Queued, _) => true,
            (JobStatus::Running { .. }, Some(owner)) => {
                self.is_client_alive(&owner).await.unwrap_or_else(|e| {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to check consumer liveness");
                    false
                })
            }
            _ => false,
        }
    }

    async fn kill_job(&self, job_id: &JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: i32 = cancel_script()
            .key(self.keys.status(job_id.as_str()))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;

        match result {
            -1 => Err(DroverError::JobNotFound(job_id.to_string())),
            0 => {
                tracing::debug!(job_id = %job_id, "Job already finished, nothing to kill");
                Ok(())
            }
            _ => {
                tracing::info!(job_id = %job_id, "Job cancelled, owning consumer will kill it");
                Ok(())
            }
        }
    }

    async fn status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        Ok(read_record(&self.conn, &self.keys, job_id.as_str())
            .await?
            .map(|record| record.status))
    }

    async fn clean_up_jobs(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.keys.known())
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;

        let script = clean_up_script();
        let mut removed = 0;
        for id in ids {
            let dropped: i32 = script
                .key(self.keys.status(&id))
                .key(self.keys.known())
                .arg(self.keys.client_prefix())
                .arg(&id)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| DroverError::Store(e.to_string()))?;
            removed += dropped as usize;
        }

        if removed > 0 {
            tracing::debug!(removed, "Cleaned up inactive jobs");
        }
        Ok(removed)
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::info!("Broker queue has no local workers, nothing to drain");
        Ok(())
    }
}

/// State shared by the workers of one consumer.
#[derive(Clone)]
struct ConsumerContext {
    client: redis::Client,
    conn: ConnectionManager,
    keys: RedisKeys,
    ownership: Ownership,
    sessions: SharedSessionProvider,
    processes: SharedProcessControl,
    running: Arc<AtomicBool>,
    fetch_timeout: Duration,
    poll_interval: Duration,
}

impl ConsumerContext {
    async fn set_from(
        &self,
        script: redis::Script,
        job_id: &JobId,
        status: JobStatus,
        pid: Option<u32>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let record = JobRecord::new(status, Some(self.ownership.identity())).to_json()?;
        let mut invocation = script.key(self.keys.status(job_id.as_str()));
        invocation.arg(record);
        if let Some(pid) = pid {
            invocation.arg(pid);
        }
        let changed: i32 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;
        Ok(changed == 1)
    }

    async fn is_still_queued(&self, job_id: &JobId) -> bool {
        match read_record(&self.conn, &self.keys, job_id.as_str()).await {
            Ok(record) => record.map(|r| r.status) == Some(JobStatus::Queued),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to re-read job status");
                true
            }
        }
    }

    async fn is_cancelled(&self, job_id: &JobId) -> bool {
        match read_record(&self.conn, &self.keys, job_id.as_str()).await {
            Ok(Some(record)) => record.status == JobStatus::Cancelled,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to poll job status");
                false
            }
        }
    }

    async fn run(self, worker_id: usize) -> Result<()> {
        tracing::debug!(worker_id, "Consumer worker started");

        let client = self.client.clone();
        let mut fetch_conn = ConnectionManager::new(client)
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.fetch_and_process(worker_id, &mut fetch_conn).await {
                tracing::error!(worker_id, error = %e, "Consumer worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        tracing::debug!(worker_id, "Consumer worker stopped");
        Ok(())
    }

    async fn fetch_and_process(
        &self,
        worker_id: usize,
        fetch_conn: &mut ConnectionManager,
    ) -> Result<bool> {
        let popped: Option<(String, String)> = fetch_conn
            .brpop(self.keys.jobs(), self.fetch_timeout.as_secs_f64())
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;
        let Some((_, job_json)) = popped else {
            return Ok(false);
        };

        let job = match Job::from_json(&job_json) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Failed to parse job, dropping it");
                return Ok(true);
            }
        };

        let outcome = self.execute(worker_id, &job).await?;
        tracing::debug!(worker_id, job_id = %job.id, outcome = outcome.label(), "Job finished");
        Ok(true)
    }

    async fn execute(&self, worker_id: usize, job: &Job) -> Result<JobOutcome> {
        let record = read_record(&self.conn, &self.keys, job.id.as_str()).await?;
        if record.map(|r| r.status) != Some(JobStatus::Queued) {
            tracing::debug!(worker_id, job_id = %job.id, "Job no longer queued, skipping");
            return Ok(JobOutcome::Skipped);
        }

        let job_id = &job.id;
        let target = &job.target;

        let result = run_scoped(self.sessions.as_ref(), job, |env| async move {
            if !self.is_still_queued(job_id).await {
                tracing::debug!(worker_id, job_id = %job_id, "Job cancelled while opening session");
                return JobOutcome::Skipped;
            }

            let mut child = match spawn_target(target, &env) {
                Ok(child) => child,
                Err(e) => {
                    self.finish_not_started(job_id).await;
                    return JobOutcome::NotStarted {
                        reason: e.to_string(),
                    };
                }
            };
            let Some(pid) = child.id() else {
                self.finish_not_started(job_id).await;
                return JobOutcome::NotStarted {
                    reason: "process exited before its pid was read".to_string(),
                };
            };

            let started = self
                .set_from(from_queued_script(), job_id, JobStatus::Running { pid }, None)
                .await
                .unwrap_or_else(|e| {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job running");
                    false
                });
            if !started {
                tracing::info!(worker_id, job_id = %job_id, pid, "Job cancelled before start, killing fresh process");
                if let Err(e) = self.processes.kill(pid) {
                    tracing::warn!(job_id = %job_id, pid, error = %e, "Failed to kill process");
                }
                if let Err(e) = child.wait().await {
                    tracing::error!(job_id = %job_id, pid, error = %e, "Failed to wait on killed process");
                }
                return JobOutcome::Skipped;
            }

            tracing::debug!(worker_id, job_id = %job_id, pid, "Job process started");

            let mut killed = false;
            let exit = loop {
                tokio::select! {
                    exit = child.wait() => break exit,
                    _ = tokio::time::sleep(self.poll_interval), if !killed => {
                        if self.is_cancelled(job_id).await {
                            tracing::info!(job_id = %job_id, pid, "Job cancelled, killing process");
                            if let Err(e) = self.processes.kill(pid) {
                                tracing::error!(job_id = %job_id, pid, error = %e, "Failed to kill job process");
                            }
                            killed = true;
                        }
                    }
                }
            };

            let outcome = match exit {
                Ok(status) => JobOutcome::from_exit_status(status),
                Err(e) => {
                    tracing::error!(job_id = %job_id, pid, error = %e, "Failed to wait on job process");
                    JobOutcome::Failed {
                        exit_code: None,
                        signal: None,
                    }
                }
            };

            match self
                .set_from(from_running_script(), job_id, JobStatus::Completed, Some(pid))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(worker_id, job_id = %job_id, pid, "Job was cancelled while running")
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job completed")
                }
            }

            outcome
        })
        .await;

        match result {
            Ok(outcome) => {
                if let JobOutcome::Failed { exit_code, signal } = &outcome {
                    tracing::warn!(
                        worker_id,
                        job_id = %job.id,
                        exit_code = ?exit_code,
                        signal = ?signal,
                        "Job failed"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                self.finish_not_started(&job.id).await;
                tracing::error!(worker_id, job_id = %job.id, error = %e, "Failed to open job session");
                Err(e)
            }
        }
    }

    async fn finish_not_started(&self, job_id: &JobId) {
        if let Err(e) = self
            .set_from(from_queued_script(), job_id, JobStatus::Completed, None)
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job completed");
        }
    }
}

/// Pops jobs published by a [`RedisQueue`] and runs them.
pub struct RedisConsumer {
    context: ConsumerContext,
    concurrency: usize,
    liveness_interval: Duration,
    shutdown_timeout: Duration,
}

impl RedisConsumer {
    /// Create a new builder for RedisConsumer.
    pub fn builder() -> RedisConsumerBuilder {
        RedisConsumerBuilder::new()
    }

    /// This consumer's identity.
    pub fn identity(&self) -> &ClientIdentity {
        self.context.ownership.identity()
    }

    /// Run until `shutdown` resolves, then drain in-flight jobs.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        self.context.running.store(true, Ordering::SeqCst);
        tracing::info!(
            identity = %self.identity(),
            concurrency = self.concurrency,
            "Consumer started"
        );

        let mut tasks = JoinSet::new();
        for worker_id in 0..self.concurrency {
            let context = self.context.clone();
            tasks.spawn(context.run(worker_id));
        }

        let context = self.context.clone();
        let liveness_interval = self.liveness_interval;
        tasks.spawn(async move {
            while context.running.load(Ordering::SeqCst) {
                if let Err(e) = context.ownership.refresh().await {
                    tracing::warn!(error = %e, "Failed to refresh liveness");
                }
                tokio::time::sleep(liveness_interval).await;
            }
            Ok(())
        });

        shutdown.await;
        tracing::info!("Consumer shutting down, draining in-flight jobs");
        self.context.running.store(false, Ordering::SeqCst);

        let drain = async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "Consumer task failed"),
                    Err(e) => tracing::error!(error = %e, "Consumer task panicked"),
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            tracing::warn!("Shutdown timeout reached, abandoning in-flight jobs");
            tasks.abort_all();
        }

        tracing::info!("Consumer stopped");
        Ok(())
    }

    /// Stop fetching new jobs.
    pub fn stop(&self) {
        self.context.running.store(false, Ordering::SeqCst);
    }
}

/// Builder for RedisConsumer.
pub struct RedisConsumerBuilder {
    redis_url: Option<String>,
    config: QueueConfig,
    identity: Option<ClientIdentity>,
    sessions: SharedSessionProvider,
    processes: SharedProcessControl,
    fetch_timeout: Duration,
}

impl Default for RedisConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RedisConsumerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            redis_url: None,
            config: QueueConfig::default(),
            identity: None,
            sessions: Arc::new(NoopSessions),
            processes: Arc::new(SystemProcesses),
            fetch_timeout: Duration::from_secs(1),
        }
    }

    /// Set the Redis URL.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set the queue configuration (namespace, concurrency, intervals).
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the consumer identity (defaults to `{host}-{pid}`).
    pub fn identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the session provider.
    pub fn sessions(mut self, sessions: impl SessionProvider + 'static) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }

    /// Set an already shared session provider.
    pub fn shared_sessions(mut self, sessions: SharedSessionProvider) -> Self {
        self.sessions = sessions;
        self
    }

    /// Set the process control implementation.
    pub fn processes(mut self, processes: impl ProcessControl + 'static) -> Self {
        self.processes = Arc::new(processes);
        self
    }

    /// Set how long one fetch blocks waiting for a job.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Connect and build the consumer.
    pub async fn build(self) -> Result<RedisConsumer> {
        let redis_url = self
            .redis_url
            .ok_or_else(|| DroverError::Config("redis_url is required".to_string()))?;
        let client =
            redis::Client::open(redis_url).map_err(|e| DroverError::Store(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| DroverError::Store(e.to_string()))?;

        let keys = RedisKeys::new(self.config.namespace.clone());
        let ownership = Ownership::new(
            SharedStore::new(RedisStore::with_connection(conn.clone())),
            self.config.namespace.clone(),
            self.identity.unwrap_or_else(ClientIdentity::current),
            self.config.liveness_ttl,
            self.config.claim_ttl,
        );

        Ok(RedisConsumer {
            context: ConsumerContext {
                client,
                conn,
                keys,
                ownership,
                sessions: self.sessions,
                processes: self.processes,
                running: Arc::new(AtomicBool::new(false)),
                fetch_timeout: self.fetch_timeout,
                poll_interval: self.config.poll_interval,
            },
            concurrency: self.config.concurrency,
            liveness_interval: self.config.liveness_ttl / 3,
            shutdown_timeout: self.config.shutdown_timeout,
        })
    }
}
