//! # drover-server - Entry point for the drover job execution subsystem
//!
//! This crate wires the pieces of `drover-core` and its backends into the
//! services one drover process runs:
//!
//! - **Scheduler process** (`drover scheduler`): applies migrations, then on
//!   a fixed cadence takes the tick lock, enqueues every job from the
//!   schedule file and sweeps finished jobs.
//! - **Scheduler supervisor** (`drover supervise`): keeps exactly one
//!   scheduler process alive and logs its memory growth.
//! - **Consumer** (`drover consume`): runs jobs published to the Redis broker.
//! - **One-off runs** (`drover run`): enqueue a job and wait for it.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use drover_server::{shutdown_signal, Orchestrator, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> drover_core::Result<()> {
//!     let orchestrator = Orchestrator::init(ServerConfig::from_env()?).await?;
//!     orchestrator.run_scheduler(shutdown_signal()).await?;
//!     orchestrator.shutdown().await
//! }
//! ```

mod config;
mod factory;
mod server;
mod tick;

pub use config::{QueueKind, ServerConfig, ServerConfigBuilder};
pub use factory::QueueFactory;
pub use server::{shutdown_signal, Orchestrator};
pub use tick::{load_schedule, ScheduleEntry, SchedulerTick, TickReport, TICK_LOCK_KEY};
