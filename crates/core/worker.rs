//! Worker that executes exactly one dequeued job.

use crate::error::Result;
use crate::executor::{spawn_target, JobOutcome};
use crate::job::{Job, JobStatus};
use crate::process::SharedProcessControl;
use crate::registry::JobRegistry;
use crate::session::{run_scoped, SharedSessionProvider};

/// Executes one job as its own OS process inside a fresh session.
///
/// The registry entry always ends terminal once the job got past the
/// queued check: `Completed` after the process exits (successfully or not,
/// or if it never started), or `Cancelled` if `kill_job` got there first.
#[derive(Clone)]
pub struct Worker {
    id: usize,
    registry: JobRegistry,
    sessions: SharedSessionProvider,
    processes: SharedProcessControl,
}

impl Worker {
    /// Create a worker.
    pub fn new(
        id: usize,
        registry: JobRegistry,
        sessions: SharedSessionProvider,
        processes: SharedProcessControl,
    ) -> Self {
        Self {
            id,
            registry,
            sessions,
            processes,
        }
    }

    /// Execute `job`.
    ///
    /// Returns the outcome of the job process. A job that is no longer
    /// `Queued` (for instance cancelled while waiting) is skipped without
    /// running its target. The status is checked again once the session is
    /// open; a cancellation landing after that check but before the job is
    /// marked running still spawns the process, which is then killed at once.
    pub async fn execute(&self, job: Job) -> Result<JobOutcome> {
        if self.registry.get(&job.id).await != Some(JobStatus::Queued) {
            tracing::debug!(
                worker_id = self.id,
                job_id = %job.id,
                "Job no longer queued, skipping"
            );
            return Ok(JobOutcome::Skipped);
        }

        let worker_id = self.id;
        let job_id = job.id.clone();
        let target = &job.target;
        let registry = self.registry.clone();
        let processes = self.processes.clone();

        let result = run_scoped(self.sessions.as_ref(), &job, |env| async move {
            if registry.get(&job_id).await != Some(JobStatus::Queued) {
                tracing::debug!(worker_id, job_id = %job_id, "Job cancelled while opening session");
                return JobOutcome::Skipped;
            }

            let mut child = match spawn_target(target, &env) {
                Ok(child) => child,
                Err(e) => {
                    registry.mark_not_started(&job_id).await;
                    return JobOutcome::NotStarted {
                        reason: e.to_string(),
                    };
                }
            };

            let Some(pid) = child.id() else {
                registry.mark_not_started(&job_id).await;
                return JobOutcome::NotStarted {
                    reason: "process exited before its pid was read".to_string(),
                };
            };

            if !registry.mark_running(&job_id, pid).await {
                // Cancelled between the queued check and the spawn.
                tracing::info!(
                    worker_id,
                    job_id = %job_id,
                    pid,
                    "Job cancelled before start, killing fresh process"
                );
                if let Err(e) = processes.kill(pid) {
                    tracing::warn!(job_id = %job_id, pid, error = %e, "Failed to kill process");
                }
                if let Err(e) = child.wait().await {
                    tracing::error!(job_id = %job_id, pid, error = %e, "Failed to wait on killed process");
                }
                return JobOutcome::Skipped;
            }

            tracing::debug!(worker_id, job_id = %job_id, pid, "Job process started");

            let outcome = match child.wait().await {
                Ok(status) => JobOutcome::from_exit_status(status),
                Err(e) => {
                    tracing::error!(job_id = %job_id, pid, error = %e, "Failed to wait on job process");
                    JobOutcome::Failed {
                        exit_code: None,
                        signal: None,
                    }
                }
            };

            if !registry.mark_completed(&job_id, pid).await {
                tracing::info!(worker_id, job_id = %job_id, pid, "Job was cancelled while running");
            }

            outcome
        })
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.registry.mark_not_started(&job.id).await;
                tracing::error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    error = %e,
                    "Failed to open job session"
                );
                return Err(e);
            }
        };

        match &outcome {
            JobOutcome::Succeeded => {
                tracing::debug!(worker_id = self.id, job_id = %job.id, "Job completed successfully");
            }
            JobOutcome::Failed { exit_code, signal } => {
                tracing::warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    exit_code = ?exit_code,
                    signal = ?signal,
                    "Job failed"
                );
            }
            JobOutcome::NotStarted { reason } => {
                tracing::error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    reason = %reason,
                    "Job could not be started"
                );
            }
            JobOutcome::Skipped => {}
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobTarget;
    use crate::process::SystemProcesses;
    use crate::session::{NoopSessions, Session, SessionProvider};
    use std::sync::Arc;

    fn worker(registry: &JobRegistry) -> Worker {
        Worker::new(
            0,
            registry.clone(),
            Arc::new(NoopSessions),
            Arc::new(SystemProcesses),
        )
    }

    #[tokio::test]
    async fn test_execute_marks_completed() {
        let registry = JobRegistry::new();
        let job = Job::new("ok", JobTarget::new("true"));
        registry.insert_queued(job.id.clone()).await;

        let outcome = worker(&registry).execute(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded);
        assert_eq!(registry.get(&job.id).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_failed_target_still_completes() {
        let registry = JobRegistry::new();
        let job = Job::new("boom", JobTarget::shell("exit 2"));
        registry.insert_queued(job.id.clone()).await;

        let outcome = worker(&registry).execute(job.clone()).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                exit_code: Some(2),
                signal: None
            }
        );
        assert_eq!(registry.get(&job.id).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_unspawnable_target_completes() {
        let registry = JobRegistry::new();
        let job = Job::new("missing", JobTarget::new("/nonexistent/drover-test-binary"));
        registry.insert_queued(job.id.clone()).await;

        let outcome = worker(&registry).execute(job.clone()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::NotStarted { .. }));
        assert_eq!(registry.get(&job.id).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let registry = JobRegistry::new();
        let job = Job::new("cancelled", JobTarget::shell(format!("touch {}", marker.display())));
        registry.insert_queued(job.id.clone()).await;
        registry.mark_cancelled(&job.id).await;

        let outcome = worker(&registry).execute(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert!(!marker.exists());
        assert_eq!(registry.get(&job.id).await, Some(JobStatus::Cancelled));
    }

    /// Cancels the job while its session is being opened.
    struct CancellingSessions {
        registry: JobRegistry,
    }

    #[async_trait::async_trait]
    impl SessionProvider for CancellingSessions {
        async fn open(&self, job: &Job) -> Result<Box<dyn Session>> {
            self.registry.mark_cancelled(&job.id).await;
            NoopSessions.open(job).await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_session_open_skips_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let registry = JobRegistry::new();
        let job = Job::new("late_cancel", JobTarget::shell(format!("touch {}", marker.display())));
        registry.insert_queued(job.id.clone()).await;

        let w = Worker::new(
            0,
            registry.clone(),
            Arc::new(CancellingSessions {
                registry: registry.clone(),
            }),
            Arc::new(SystemProcesses),
        );
        let outcome = w.execute(job.clone()).await.unwrap();

        assert_eq!(outcome, JobOutcome::Skipped);
        assert!(!marker.exists());
        assert_eq!(registry.get(&job.id).await, Some(JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_running_pid_is_recorded() {
        let registry = JobRegistry::new();
        let job = Job::new("slow", JobTarget::new("sleep").arg("0.3"));
        registry.insert_queued(job.id.clone()).await;

        let w = worker(&registry);
        let handle = tokio::spawn(async move { w.execute(job).await });

        let id = crate::job::JobId::new("slow");
        let mut pid = None;
        for _ in 0..100 {
            if let Some(JobStatus::Running { pid: p }) = registry.get(&id).await {
                pid = Some(p);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let pid = pid.expect("job never reported running");
        assert_ne!(pid, std::process::id());

        handle.await.unwrap().unwrap();
        assert_eq!(registry.get(&id).await, Some(JobStatus::Completed));
    }
}
