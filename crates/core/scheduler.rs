//! Supervisor for the single scheduler process.
//!
//! The manager owns the scheduler's child process handle and its desired
//! state. `get_status(true)` repairs a dead scheduler whose desired state is
//! still `Running`; the foreground loop does that on a fixed cadence and logs
//! the scheduler's memory growth as it goes.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::executor::spawn_target;
use crate::memory::MemorySnapshot;
use crate::process::{SharedProcessControl, SystemProcesses};
use crate::trigger::LoopTimeTrigger;

/// Desired or observed state of the scheduler process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Stopped,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Running => write!(f, "running"),
            SchedulerState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug)]
struct SchedulerProcess {
    desired: SchedulerState,
    child: Option<Child>,
}

impl SchedulerProcess {
    /// Whether the child is still running. Reaps it if it exited.
    fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(status = %status, "Scheduler process exited");
                self.child = None;
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to check scheduler process");
                self.child = None;
                false
            }
        }
    }
}

/// Keeps exactly one scheduler process alive.
pub struct SchedulerManager {
    config: SchedulerConfig,
    processes: SharedProcessControl,
    inner: Mutex<SchedulerProcess>,
}

impl SchedulerManager {
    /// Create a manager for the scheduler described by `config`.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_processes(config, Arc::new(SystemProcesses))
    }

    /// Create a manager using a specific process control implementation.
    pub fn with_processes(config: SchedulerConfig, processes: SharedProcessControl) -> Self {
        Self {
            config,
            processes,
            inner: Mutex::new(SchedulerProcess {
                desired: SchedulerState::Stopped,
                child: None,
            }),
        }
    }

    /// PID of the scheduler process, if one is running.
    pub async fn pid(&self) -> Option<u32> {
        let mut inner = self.inner.lock().await;
        if inner.is_alive() {
            inner.child.as_ref().and_then(Child::id)
        } else {
            None
        }
    }

    /// Start the scheduler process unless it is already alive.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.desired = SchedulerState::Running;
        if inner.is_alive() {
            tracing::debug!("Scheduler already running");
            return Ok(());
        }
        self.spawn(&mut inner)
    }

    fn spawn(&self, inner: &mut SchedulerProcess) -> Result<()> {
        let child = spawn_target(&self.config.command, &[])?;
        tracing::info!(
            pid = child.id(),
            program = %self.config.command.program,
            "Scheduler process started"
        );
        inner.child = Some(child);
        Ok(())
    }

    /// Stop the scheduler: SIGTERM, then SIGKILL after the grace period.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.desired = SchedulerState::Stopped;

        let Some(mut child) = inner.child.take() else {
            tracing::debug!("Scheduler not running, nothing to stop");
            return Ok(());
        };
        let Some(pid) = child.id() else {
            return Ok(());
        };

        tracing::info!(pid, "Stopping scheduler process");
        self.processes.terminate(pid)?;

        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid, status = %status, "Scheduler process stopped");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "Failed to wait for scheduler process");
            }
            Err(_) => {
                tracing::warn!(pid, "Scheduler ignored SIGTERM, killing");
                self.processes.kill(pid)?;
                if let Err(e) = child.wait().await {
                    tracing::warn!(pid, error = %e, "Failed to reap scheduler process");
                }
            }
        }
        Ok(())
    }

    /// Report whether the scheduler is running.
    ///
    /// With `auto_restart`, a dead scheduler whose desired state is still
    /// `Running` is started again first.
    pub async fn get_status(&self, auto_restart: bool) -> Result<SchedulerState> {
        let mut inner = self.inner.lock().await;
        if inner.is_alive() {
            return Ok(SchedulerState::Running);
        }

        if auto_restart && inner.desired == SchedulerState::Running {
            tracing::warn!("Scheduler process is not running, restarting");
            self.spawn(&mut inner)?;
            if inner.is_alive() {
                return Ok(SchedulerState::Running);
            }
        }
        Ok(SchedulerState::Stopped)
    }

    /// Start the scheduler and keep it alive until `shutdown` resolves, then
    /// stop it.
    pub async fn run_foreground<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        self.start().await?;

        let baseline = std::sync::Mutex::new(None);
        let baseline = &baseline;
        LoopTimeTrigger::new(self.config.auto_restart_interval)
            .run_until(move || async move { self.health_check(baseline).await }, shutdown)
            .await;

        self.stop().await
    }

    async fn health_check(
        &self,
        baseline: &std::sync::Mutex<Option<(u32, MemorySnapshot)>>,
    ) -> Result<()> {
        let state = self.get_status(true).await?;
        let Some(pid) = self.pid().await else {
            tracing::warn!(state = %state, "Scheduler has no live process");
            return Ok(());
        };

        let snapshot = match MemorySnapshot::capture(pid) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(pid, error = %e, "Memory snapshot unavailable");
                return Ok(());
            }
        };

        let mut baseline = baseline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match *baseline {
            Some((base_pid, ref base)) if base_pid == pid => {
                tracing::info!(pid, memory = %snapshot.diff(base), "Scheduler memory since start");
            }
            _ => {
                tracing::info!(
                    pid,
                    rss_kb = snapshot.rss_kb,
                    vm_kb = snapshot.vm_kb,
                    "Scheduler memory baseline"
                );
                *baseline = Some((pid, snapshot));
            }
        }
        Ok(())
    }
}

/// One-off setup the scheduler process runs before its first tick.
#[async_trait]
pub trait Migrator: Send + Sync {
    async fn migrate(&self) -> Result<()>;
}

/// Body of the scheduler process.
///
/// Runs `migrator` once, then ticks on `trigger` until `shutdown` resolves.
/// A failed migration is logged with its full error chain and the scheduler
/// carries on.
pub async fn run_scheduler_process<F, Fut, S>(
    migrator: Option<&dyn Migrator>,
    trigger: LoopTimeTrigger,
    tick: F,
    shutdown: S,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
    S: Future<Output = ()>,
{
    if let Some(migrator) = migrator {
        match migrator.migrate().await {
            Ok(()) => tracing::info!("Migrations applied"),
            Err(e) => tracing::error!(error = %error_chain(&e), "Migrations failed, continuing"),
        }
    }

    tracing::info!(
        interval_ms = trigger.interval().as_millis() as u64,
        "Scheduler loop started"
    );
    trigger.run_until(tick, shutdown).await;
    tracing::info!("Scheduler loop stopped");
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
