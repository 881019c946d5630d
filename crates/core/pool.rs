//! Worker pool supervision.
//!
//! The supervisor is started lazily by the first enqueue. Each tick it reaps
//! finished workers, refreshes this replica's liveness key, and spawns
//! workers for pending jobs up to the configured concurrency. Once the queue
//! is empty and no worker is left it exits; the next enqueue starts a new
//! one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinError, JoinSet};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::executor::JobOutcome;
use crate::job::{Job, JobStatus};
use crate::ownership::Ownership;
use crate::process::{ProcessControl, SharedProcessControl};
use crate::registry::JobRegistry;
use crate::session::SharedSessionProvider;
use crate::worker::Worker;

/// Pending jobs and supervisor bookkeeping, guarded by one lock so the
/// "queue drained, supervisor exits" decision cannot race an enqueue.
#[derive(Debug, Default)]
pub(crate) struct PoolState {
    pub(crate) pending: VecDeque<Job>,
    pub(crate) supervisor_active: bool,
    pub(crate) closed: bool,
}

impl PoolState {
    pub(crate) fn is_busy(&self) -> bool {
        self.supervisor_active || !self.pending.is_empty()
    }
}

/// State shared by a queue, its supervisor and its workers.
pub(crate) struct QueueShared {
    pub(crate) config: QueueConfig,
    pub(crate) registry: JobRegistry,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) wake: Notify,
    pub(crate) active_workers: AtomicUsize,
    pub(crate) ownership: Option<Ownership>,
    pub(crate) processes: SharedProcessControl,
    pub(crate) sessions: SharedSessionProvider,
}

/// Whether a local registry status still counts as an active job.
///
/// `Queued` only counts while the pool is busy (jobs pending or a supervisor
/// still handing them to workers); a `Running` job counts only while its
/// process exists, so a dead PID is reclaimable.
pub(crate) fn is_locally_active(
    status: &JobStatus,
    pool_busy: bool,
    processes: &dyn ProcessControl,
) -> bool {
    match status {
        JobStatus::Queued => pool_busy,
        JobStatus::Running { pid } => processes.is_alive(*pid),
        JobStatus::Completed | JobStatus::Cancelled => false,
    }
}

/// Keeps a bounded set of workers busy until the queue drains.
pub(crate) struct WorkerPoolSupervisor {
    shared: Arc<QueueShared>,
    next_worker_id: usize,
}

impl WorkerPoolSupervisor {
    pub(crate) fn new(shared: Arc<QueueShared>) -> Self {
        Self {
            shared,
            next_worker_id: 0,
        }
    }

    /// Run the supervisor loop until the queue is drained.
    pub(crate) async fn run(mut self) {
        let concurrency = self.shared.config.concurrency;
        tracing::info!(concurrency, "Worker pool supervisor started");

        let mut workers: JoinSet<Result<JobOutcome>> = JoinSet::new();

        loop {
            while let Some(result) = workers.try_join_next() {
                Self::log_worker_result(result);
            }

            self.refresh_liveness().await;

            while workers.len() < concurrency {
                let next = self.shared.state.lock().await.pending.pop_front();
                let Some(job) = next else {
                    break;
                };
                self.spawn_worker(&mut workers, job);
            }
            self.shared
                .active_workers
                .store(workers.len(), Ordering::SeqCst);

            {
                let mut state = self.shared.state.lock().await;
                if state.pending.is_empty() && workers.is_empty() {
                    state.supervisor_active = false;
                    break;
                }
            }

            tokio::select! {
                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    Self::log_worker_result(result);
                }
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(self.shared.config.poll_interval) => {}
            }
        }

        self.shared.active_workers.store(0, Ordering::SeqCst);
        tracing::info!("Queue drained, worker pool supervisor stopped");
    }

    fn spawn_worker(&mut self, workers: &mut JoinSet<Result<JobOutcome>>, job: Job) {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        tracing::debug!(worker_id, job_id = %job.id, "Spawning worker");

        let worker = Worker::new(
            worker_id,
            self.shared.registry.clone(),
            self.shared.sessions.clone(),
            self.shared.processes.clone(),
        );
        workers.spawn(async move { worker.execute(job).await });
    }

    async fn refresh_liveness(&self) {
        if let Some(ownership) = &self.shared.ownership {
            if let Err(e) = ownership.refresh().await {
                tracing::warn!(error = %e, "Failed to refresh liveness");
            }
        }
    }

    fn log_worker_result(result: std::result::Result<Result<JobOutcome>, JoinError>) {
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Worker error"),
            Err(e) => tracing::error!(error = %e, "Worker panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SystemProcesses;

    #[test]
    fn test_locally_active() {
        let procs = SystemProcesses;
        let me = procs.current_pid();

        assert!(is_locally_active(&JobStatus::Queued, true, &procs));
        assert!(!is_locally_active(&JobStatus::Queued, false, &procs));
        assert!(is_locally_active(&JobStatus::Running { pid: me }, false, &procs));
        assert!(!is_locally_active(&JobStatus::Completed, true, &procs));
        assert!(!is_locally_active(&JobStatus::Cancelled, true, &procs));
    }

    #[test]
    fn test_dead_pid_is_inactive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_locally_active(
            &JobStatus::Running { pid },
            true,
            &SystemProcesses
        ));
    }
}
