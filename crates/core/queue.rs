//! Job queue contract and the process-based implementation.

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::config::QueueConfig;
use crate::error::{DroverError, Result};
use crate::job::{Job, JobId, JobStatus};
use crate::ownership::{ClientIdentity, Ownership};
use crate::pool::{is_locally_active, PoolState, QueueShared, WorkerPoolSupervisor};
use crate::process::{ProcessControl, SharedProcessControl, SystemProcesses};
use crate::registry::JobRegistry;
use crate::session::{NoopSessions, SessionProvider, SharedSessionProvider};
use crate::store::{KvStore, SharedStore};

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was queued for execution.
    Enqueued,
    /// The job is already queued, running, or owned by a live replica.
    AlreadyActive,
}

/// The queue contract every dispatch path goes through.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue `job` unless it is already known. Idempotent per job id.
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome>;

    /// Whether `job_id` is queued or running anywhere this queue can see.
    async fn has_job(&self, job_id: &JobId) -> bool;

    /// Cancel `job_id`, killing its process if it is running.
    ///
    /// Side effects a running job already produced are not undone.
    async fn kill_job(&self, job_id: &JobId) -> Result<()>;

    /// Current status of `job_id`, if tracked.
    async fn status(&self, job_id: &JobId) -> Result<Option<JobStatus>>;

    /// Drop bookkeeping for jobs that are no longer active. Returns how many
    /// entries were removed.
    async fn clean_up_jobs(&self) -> Result<usize>;

    /// Stop accepting work and wind down running jobs.
    async fn shutdown(&self) -> Result<()>;
}

/// A type-erased queue that can be shared across tasks.
pub type SharedQueue = Arc<dyn JobQueue>;

/// Queue that runs every job as a local OS process.
///
/// Cross-replica ownership is tracked in the optional store; without one the
/// queue only knows about its own jobs.
#[derive(Clone)]
pub struct ProcessQueue {
    shared: Arc<QueueShared>,
}

impl ProcessQueue {
    /// Create a new builder for ProcessQueue.
    pub fn builder() -> ProcessQueueBuilder {
        ProcessQueueBuilder::new()
    }

    /// The job registry.
    pub fn registry(&self) -> &JobRegistry {
        &self.shared.registry
    }

    /// The queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// This replica's identity, when an external store is configured.
    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.shared.ownership.as_ref().map(Ownership::identity)
    }

    /// Number of jobs waiting for a worker.
    pub async fn queue_len(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }

    /// Number of live workers.
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::SeqCst)
    }

    /// Whether a worker pool supervisor is currently running.
    pub async fn is_supervisor_active(&self) -> bool {
        self.shared.state.lock().await.supervisor_active
    }

    async fn pool_busy(&self) -> bool {
        self.shared.state.lock().await.is_busy()
    }

    async fn owned_elsewhere(&self, job_id: &JobId) -> bool {
        let Some(ownership) = &self.shared.ownership else {
            return false;
        };
        match ownership.owned_elsewhere(job_id.as_str()).await {
            Ok(owned) => owned,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Ownership lookup failed, using local state");
                false
            }
        }
    }

    async fn refresh_liveness(&self) {
        if let Some(ownership) = &self.shared.ownership {
            if let Err(e) = ownership.refresh().await {
                tracing::warn!(error = %e, "Failed to refresh liveness");
            }
        }
    }

    /// Claim the job in the store. `false` means a live replica owns it.
    async fn claim(&self, job_id: &JobId) -> bool {
        let Some(ownership) = &self.shared.ownership else {
            return true;
        };
        match ownership.claim(job_id.as_str()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Ownership not claimed, queueing locally");
                true
            }
        }
    }

    async fn release_claim(&self, job_id: &JobId) {
        if let Some(ownership) = &self.shared.ownership {
            if let Err(e) = ownership.release(job_id.as_str()).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to release ownership claim");
            }
        }
    }

    /// Wait until the supervisor has exited or `timeout` passes.
    async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_supervisor_active().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl JobQueue for ProcessQueue {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome> {
        let job_id = job.id.clone();

        if self.has_job(&job_id).await {
            tracing::info!(job_id = %job_id, "Job already active, skipping enqueue");
            return Ok(EnqueueOutcome::AlreadyActive);
        }

        if self.shared.state.lock().await.closed {
            return Err(closed_error(&job_id));
        }

        if !self.claim(&job_id).await {
            tracing::info!(job_id = %job_id, "Job owned by another live replica, skipping enqueue");
            return Ok(EnqueueOutcome::AlreadyActive);
        }

        let start_supervisor = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                drop(state);
                self.release_claim(&job_id).await;
                return Err(closed_error(&job_id));
            }

            let pool_busy = state.is_busy();
            let processes = self.shared.processes.as_ref();
            let recorded = self
                .shared
                .registry
                .insert_if_inactive(&job_id, |s| is_locally_active(s, pool_busy, processes))
                .await;
            if !recorded {
                tracing::info!(job_id = %job_id, "Job became active concurrently, skipping enqueue");
                return Ok(EnqueueOutcome::AlreadyActive);
            }

            state.pending.push_back(job);
            let start = !state.supervisor_active;
            state.supervisor_active = true;
            start
        };

        if start_supervisor {
            tracing::debug!("Starting worker pool supervisor");
            tokio::spawn(WorkerPoolSupervisor::new(self.shared.clone()).run());
        } else {
            self.shared.wake.notify_one();
        }

        self.refresh_liveness().await;

        tracing::info!(job_id = %job_id, "Job enqueued");
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn has_job(&self, job_id: &JobId) -> bool {
        if self.owned_elsewhere(job_id).await {
            return true;
        }

        let pool_busy = self.pool_busy().await;
        match self.shared.registry.get(job_id).await {
            Some(status) => is_locally_active(&status, pool_busy, self.shared.processes.as_ref()),
            None => false,
        }
    }

    async fn kill_job(&self, job_id: &JobId) -> Result<()> {
        let status = self
            .shared
            .registry
            .get(job_id)
            .await
            .ok_or_else(|| DroverError::JobNotFound(job_id.to_string()))?;

        match status {
            JobStatus::Running { pid } => {
                // Cancelled before the signal: once the child dies its worker
                // may reap it and complete the job on another thread.
                self.shared.registry.mark_cancelled(job_id).await;

                let processes = &self.shared.processes;
                if pid == processes.current_pid() {
                    tracing::warn!(job_id = %job_id, pid, "Killing own process for job");
                    processes.kill(pid)?;
                } else {
                    tracing::info!(job_id = %job_id, pid, "Killing job process");
                    if let Err(e) = processes.kill(pid) {
                        tracing::error!(job_id = %job_id, pid, error = %e, "Failed to kill job process");
                    }
                }
            }
            JobStatus::Queued => {
                self.shared.registry.mark_cancelled(job_id).await;
                tracing::info!(job_id = %job_id, "Queued job cancelled");
            }
            JobStatus::Completed | JobStatus::Cancelled => {
                tracing::debug!(job_id = %job_id, status = %status, "Job already finished, nothing to kill");
            }
        }

        Ok(())
    }

    async fn status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        Ok(self.shared.registry.get(job_id).await)
    }

    async fn clean_up_jobs(&self) -> Result<usize> {
        let mut removed = 0;

        for (job_id, _) in self.shared.registry.snapshot().await {
            if self.owned_elsewhere(&job_id).await {
                continue;
            }

            // Held across the removal so an enqueue cannot slip in between.
            let dropped = {
                let state = self.shared.state.lock().await;
                let pool_busy = state.is_busy();
                let processes = self.shared.processes.as_ref();
                self.shared
                    .registry
                    .remove_if_inactive(&job_id, |s| is_locally_active(s, pool_busy, processes))
                    .await
            };

            if dropped {
                self.release_claim(&job_id).await;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(removed, "Cleaned up inactive jobs");
        }
        Ok(removed)
    }

    async fn shutdown(&self) -> Result<()> {
        let cancelled: Vec<JobId> = {
            let mut state = self.shared.state.lock().await;
            state.closed = true;
            state.pending.drain(..).map(|job| job.id).collect()
        };
        for job_id in &cancelled {
            self.shared.registry.mark_cancelled(job_id).await;
        }
        self.shared.wake.notify_one();

        tracing::info!(cancelled = cancelled.len(), "Queue shutting down, draining running jobs");

        if self.wait_for_drain(self.shared.config.shutdown_timeout).await {
            tracing::info!("Queue stopped");
            return Ok(());
        }

        tracing::warn!(
            in_progress = self.active_workers(),
            "Shutdown timeout reached, killing running jobs"
        );
        for (job_id, status) in self.shared.registry.snapshot().await {
            if matches!(status, JobStatus::Running { .. }) {
                self.kill_job(&job_id).await?;
            }
        }

        if self.wait_for_drain(Duration::from_secs(5)).await {
            Ok(())
        } else {
            Err(DroverError::Timeout(
                "worker pool did not stop after killing running jobs".to_string(),
            ))
        }
    }
}

fn closed_error(job_id: &JobId) -> DroverError {
    DroverError::QueueClosed(format!("cannot enqueue {} after shutdown", job_id))
}

/// Builder for ProcessQueue.
pub struct ProcessQueueBuilder {
    config: QueueConfig,
    store: Option<SharedStore>,
    identity: Option<ClientIdentity>,
    sessions: SharedSessionProvider,
    processes: SharedProcessControl,
}

impl Default for ProcessQueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessQueueBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: QueueConfig::default(),
            store: None,
            identity: None,
            sessions: Arc::new(NoopSessions),
            processes: Arc::new(SystemProcesses),
        }
    }

    /// Set the queue configuration.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the external store used for ownership tracking.
    pub fn store(mut self, store: impl KvStore + 'static) -> Self {
        self.store = Some(SharedStore::new(store));
        self
    }

    /// Set an already shared external store.
    pub fn shared_store(mut self, store: Option<SharedStore>) -> Self {
        self.store = store;
        self
    }

    /// Override this replica's identity (defaults to `{host}-{pid}`).
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

    /// Build the ProcessQueue.
    pub fn build(self) -> ProcessQueue {
        let ownership = self.store.map(|store| {
            Ownership::new(
                store,
                self.config.namespace.clone(),
                self.identity.unwrap_or_else(ClientIdentity::current),
                self.config.liveness_ttl,
                self.config.claim_ttl,
            )
        });

        ProcessQueue {
            shared: Arc::new(QueueShared {
                config: self.config,
                registry: JobRegistry::new(),
                state: Mutex::new(PoolState::default()),
                wake: Notify::new(),
                active_workers: Default::default(),
                ownership,
                processes: self.processes,
                sessions: self.sessions,
            }),
        }
    }
}
