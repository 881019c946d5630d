//! Scoped per-job resource sessions.
//!
//! A worker opens a fresh session for every job it executes, hands the
//! session's coordinates to the job process through its environment, and
//! closes the session with the job's outcome on every exit path. Sessions are
//! never shared between jobs.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::executor::JobOutcome;
use crate::job::Job;

/// Opens sessions for jobs.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Open a fresh session for `job` in the current process.
    async fn open(&self, job: &Job) -> Result<Box<dyn Session>>;
}

/// One open session.
#[async_trait]
pub trait Session: Send {
    /// Environment variables that let the job process reach this session.
    fn env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Release the session, recording how the job ended.
    async fn close(self: Box<Self>, outcome: &JobOutcome) -> Result<()>;
}

/// Shared handle to a session provider.
pub type SharedSessionProvider = Arc<dyn SessionProvider>;

/// Provider whose sessions hold no resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSessions;

struct NoopSession;

#[async_trait]
impl SessionProvider for NoopSessions {
    async fn open(&self, _job: &Job) -> Result<Box<dyn Session>> {
        Ok(Box::new(NoopSession))
    }
}

#[async_trait]
impl Session for NoopSession {
    async fn close(self: Box<Self>, _outcome: &JobOutcome) -> Result<()> {
        Ok(())
    }
}

/// Run `body` inside a fresh session for `job`.
///
/// `body` receives the session environment. The session is closed with the
/// outcome `body` produced; a close failure is logged and does not change the
/// outcome.
pub async fn run_scoped<F, Fut>(
    provider: &dyn SessionProvider,
    job: &Job,
    body: F,
) -> Result<JobOutcome>
where
    F: FnOnce(Vec<(String, String)>) -> Fut,
    Fut: Future<Output = JobOutcome>,
{
    let session = provider.open(job).await?;
    let outcome = body(session.env()).await;

    if let Err(e) = session.close(&outcome).await {
        tracing::warn!(job_id = %job.id, error = %e, "Failed to close job session");
    }

    Ok(outcome)
}
