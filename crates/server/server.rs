//! The orchestrator service wiring queue, lock, sessions and scheduler.

use std::future::Future;
use std::time::Duration;

use drover_core::{
    run_scheduler_process, DistributedLock, DroverError, Job, JobId, JobStatus, JobTarget,
    LoopTimeTrigger, Migrator, Result, SchedulerConfig, SchedulerManager, SharedQueue,
    SharedSessionProvider, SharedStore,
};
use drover_redis::RedisConsumer;
use drover_sqlite::SqliteMigrator;

use crate::config::ServerConfig;
use crate::factory::QueueFactory;
use crate::tick::SchedulerTick;

/// Owns the services of one drover process between `init` and `shutdown`.
pub struct Orchestrator {
    config: ServerConfig,
    store: Option<SharedStore>,
    sessions: SharedSessionProvider,
    queue: SharedQueue,
}

impl Orchestrator {
    /// Build every service the configuration asks for.
    pub async fn init(config: ServerConfig) -> Result<Self> {
        let store = QueueFactory::store(&config).await?;
        let sessions = QueueFactory::sessions(&config);
        let queue = QueueFactory::create(&config, store.clone(), sessions.clone()).await?;

        tracing::info!(
            namespace = %config.namespace,
            queue = ?config.queue,
            "Orchestrator initialized"
        );

        Ok(Self {
            config,
            store,
            sessions,
            queue,
        })
    }

    /// The configuration this orchestrator was built from.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The job queue.
    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    /// A distributed lock over the configured store.
    pub fn lock(&self) -> DistributedLock {
        DistributedLock::new(self.store.clone())
    }

    /// Migrator for the configured database, if any.
    pub fn migrator(&self) -> Option<SqliteMigrator> {
        self.config
            .database_url
            .as_ref()
            .map(|url| SqliteMigrator::new(url.clone(), self.config.namespace.clone()))
    }

    /// Body of the scheduler process: migrate, then tick until `shutdown`.
    pub async fn run_scheduler<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let tick = SchedulerTick::new(
            self.queue.clone(),
            self.lock(),
            self.config.schedule_file.clone(),
            self.config.lock_ttl,
        );
        let migrator = self.migrator();
        let tick = &tick;

        run_scheduler_process(
            migrator.as_ref().map(|m| m as &dyn Migrator),
            LoopTimeTrigger::new(self.config.scheduler_interval),
            move || async move { tick.run().await.map(|_| ()) },
            shutdown,
        )
        .await;
        Ok(())
    }

    /// Keep a scheduler process running `command` alive until `shutdown`.
    pub async fn supervise<S>(&self, command: JobTarget, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let manager = SchedulerManager::new(
            SchedulerConfig::new(command)
                .auto_restart_interval(self.config.auto_restart_interval),
        );
        manager.run_foreground(shutdown).await
    }

    /// Enqueue `job` and wait until it reaches a terminal status.
    pub async fn run_job(&self, job: Job, poll_interval: Duration) -> Result<JobStatus> {
        let id = job.id.clone();
        self.queue.enqueue(job).await?;
        wait_for_terminal(&self.queue, &id, poll_interval).await
    }

    /// Consume jobs from the Redis broker until `shutdown`.
    pub async fn consume<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let redis_url = self.config.redis_url.clone().ok_or_else(|| {
            DroverError::Config("consume requires DROVER_REDIS_URL".to_string())
        })?;

        let consumer = RedisConsumer::builder()
            .redis_url(redis_url)
            .config(self.config.queue_config())
            .shared_sessions(self.sessions.clone())
            .build()
            .await?;
        consumer.run_until(shutdown).await
    }

    /// Stop the queue and wind down running jobs.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Orchestrator shutting down");
        self.queue.shutdown().await
    }
}

async fn wait_for_terminal(
    queue: &SharedQueue,
    id: &JobId,
    poll_interval: Duration,
) -> Result<JobStatus> {
    loop {
        match queue.status(id).await? {
            Some(status) if status.is_terminal() => return Ok(status),
            Some(_) => {}
            None => return Err(DroverError::JobNotFound(id.to_string())),
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
