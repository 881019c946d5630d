//! # drover-core - Background job execution for the drover orchestrator
//!
//! This crate provides the execution subsystem the orchestrator dispatches
//! pipeline work through:
//! - `JobQueue` trait and the process-based `ProcessQueue`
//! - `JobRegistry` with guarded status transitions
//! - `Worker` and the worker pool supervisor
//! - `SchedulerManager` keeping the scheduler process alive
//! - `LoopTimeTrigger` fixed-cadence loop
//! - `KvStore` trait, `DistributedLock` and cross-replica `Ownership`
//! - `SessionProvider` for per-job resource sessions
//! - Error types

mod config;
mod error;
mod executor;
mod job;
mod lock;
mod memory;
mod ownership;
mod pool;
mod process;
mod queue;
mod registry;
mod scheduler;
mod session;
mod store;
mod trigger;
mod worker;

// Re-export main types
pub use config::{
    cpu_concurrency, parse_concurrency, QueueConfig, QueueConfigBuilder, SchedulerConfig,
    DEFAULT_AUTO_RESTART_INTERVAL, DEFAULT_CONCURRENCY,
};
pub use error::{DroverError, Result};
pub use executor::{spawn_target, JobOutcome};
pub use job::{Job, JobId, JobStatus, JobTarget};
pub use lock::{DistributedLock, DEFAULT_LOCK_KEY_PREFIX};
pub use memory::{MemoryDiff, MemorySnapshot};
pub use ownership::{ClientIdentity, Ownership};
pub use process::{ProcessControl, SharedProcessControl, SystemProcesses};
pub use queue::{EnqueueOutcome, JobQueue, ProcessQueue, ProcessQueueBuilder, SharedQueue};
pub use registry::JobRegistry;
pub use scheduler::{run_scheduler_process, Migrator, SchedulerManager, SchedulerState};
pub use session::{run_scoped, NoopSessions, Session, SessionProvider, SharedSessionProvider};
pub use store::{DynStore, KvStore, MemoryStore, SharedStore, StoreKeys, DROVER_KEY_PREFIX};
pub use trigger::LoopTimeTrigger;
pub use worker::Worker;
