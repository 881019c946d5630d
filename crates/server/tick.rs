//! The scheduler tick: enqueue scheduled jobs and sweep finished ones.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use drover_core::{DistributedLock, DroverError, Job, JobId, JobTarget, Result, SharedQueue};

/// Lock key serializing ticks across scheduler replicas.
pub const TICK_LOCK_KEY: &str = "scheduler_tick";

/// One entry of the schedule file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleEntry {
    pub id: JobId,
    #[serde(flatten)]
    pub target: JobTarget,
}

/// Load the schedule file: a JSON array of entries.
pub fn load_schedule(path: &Path) -> Result<Vec<ScheduleEntry>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        DroverError::Config(format!("failed to read schedule {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub enqueued: usize,
    pub already_active: usize,
    pub cleaned: usize,
}

/// One scheduler iteration, run under the distributed tick lock.
pub struct SchedulerTick {
    queue: SharedQueue,
    lock: DistributedLock,
    schedule_file: Option<PathBuf>,
    lock_ttl: Duration,
}

impl SchedulerTick {
    pub fn new(
        queue: SharedQueue,
        lock: DistributedLock,
        schedule_file: Option<PathBuf>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            queue,
            lock,
            schedule_file,
            lock_ttl,
        }
    }

    /// Run one tick. Returns `None` when another scheduler holds the lock.
    pub async fn run(&self) -> Result<Option<TickReport>> {
        match self
            .lock
            .with_lock(TICK_LOCK_KEY, self.lock_ttl, self.run_locked())
            .await
        {
            Some(report) => report.map(Some),
            None => {
                tracing::debug!("Another scheduler is ticking, skipping");
                Ok(None)
            }
        }
    }

    async fn run_locked(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        let entries = match &self.schedule_file {
            Some(path) => load_schedule(path)?,
            None => Vec::new(),
        };

        for entry in entries {
            let job = Job::new(entry.id, entry.target);
            match self.queue.enqueue(job).await? {
                drover_core::EnqueueOutcome::Enqueued => report.enqueued += 1,
                drover_core::EnqueueOutcome::AlreadyActive => report.already_active += 1,
            }
        }

        report.cleaned = self.queue.clean_up_jobs().await?;

        tracing::info!(
            enqueued = report.enqueued,
            already_active = report.already_active,
            cleaned = report.cleaned,
            "Scheduler tick finished"
        );
        Ok(report)
    }
}
