//! Shared job registry.
//!
//! The registry maps job ids to their current [`JobStatus`]. It is shared by
//! the queue, the pool supervisor and every worker of one queue. Each mutation
//! is a single guarded status write: transitions out of a terminal status are
//! refused, so concurrent writers can never resurrect a finished job.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::job::{JobId, JobStatus};

/// Concurrent map from job id to status.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<HashMap<JobId, JobStatus>>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the status of a job.
    pub async fn get(&self, id: &JobId) -> Option<JobStatus> {
        self.inner.read().await.get(id).copied()
    }

    /// Record a freshly enqueued job.
    ///
    /// This starts a new lifecycle for the id. Callers must only do this once
    /// they have established the id is not active.
    pub async fn insert_queued(&self, id: JobId) {
        self.inner.write().await.insert(id, JobStatus::Queued);
    }

    /// Record `id` as `Queued` unless its current status is still active.
    ///
    /// The check and the write happen under one lock, so a worker cannot
    /// move the job to `Running` in between. Returns whether it was recorded.
    pub async fn insert_if_inactive<F>(&self, id: &JobId, is_active: F) -> bool
    where
        F: FnOnce(&JobStatus) -> bool,
    {
        let mut map = self.inner.write().await;
        if map.get(id).is_some_and(is_active) {
            return false;
        }
        map.insert(id.clone(), JobStatus::Queued);
        true
    }

    /// Remove `id` if its current status is no longer active.
    pub async fn remove_if_inactive<F>(&self, id: &JobId, is_active: F) -> bool
    where
        F: FnOnce(&JobStatus) -> bool,
    {
        let mut map = self.inner.write().await;
        match map.get(id) {
            Some(status) if !is_active(status) => {
                map.remove(id);
                true
            }
            _ => false,
        }
    }

    /// `Queued → Running{pid}`. Returns false when the job is no longer queued.
    pub async fn mark_running(&self, id: &JobId, pid: u32) -> bool {
        self.transition(id, JobStatus::Running { pid }, |s| {
            matches!(s, JobStatus::Queued)
        })
        .await
    }

    /// `Running{pid} → Completed` for the same pid.
    pub async fn mark_completed(&self, id: &JobId, pid: u32) -> bool {
        self.transition(id, JobStatus::Completed, |s| {
            matches!(s, JobStatus::Running { pid: p } if *p == pid)
        })
        .await
    }

    /// `Queued → Completed`, used when the job process could not be started.
    pub async fn mark_not_started(&self, id: &JobId) -> bool {
        self.transition(id, JobStatus::Completed, |s| {
            matches!(s, JobStatus::Queued)
        })
        .await
    }

    /// Any non-terminal status → `Cancelled`.
    pub async fn mark_cancelled(&self, id: &JobId) -> bool {
        self.transition(id, JobStatus::Cancelled, |s| !s.is_terminal())
            .await
    }

    async fn transition<F>(&self, id: &JobId, to: JobStatus, allowed: F) -> bool
    where
        F: FnOnce(&JobStatus) -> bool,
    {
        let mut map = self.inner.write().await;
        match map.get_mut(id) {
            Some(status) if allowed(status) => {
                *status = to;
                true
            }
            _ => false,
        }
    }

    /// Remove an entry.
    pub async fn remove(&self, id: &JobId) -> Option<JobStatus> {
        self.inner.write().await.remove(id)
    }

    /// Copy of all entries.
    pub async fn snapshot(&self) -> Vec<(JobId, JobStatus)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, status)| (id.clone(), *status))
            .collect()
    }

    /// Number of jobs currently running.
    pub async fn running_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|s| matches!(s, JobStatus::Running { .. }))
            .count()
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn insert(&self, id: JobId, status: JobStatus) {
        self.inner.write().await.insert(id, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::new(s)
    }

    #[tokio::test]
    async fn test_happy_path() {
        let registry = JobRegistry::new();
        registry.insert_queued(id("a")).await;
        assert_eq!(registry.get(&id("a")).await, Some(JobStatus::Queued));

        assert!(registry.mark_running(&id("a"), 100).await);
        assert_eq!(
            registry.get(&id("a")).await,
            Some(JobStatus::Running { pid: 100 })
        );
        assert_eq!(registry.running_count().await, 1);

        assert!(registry.mark_completed(&id("a"), 100).await);
        assert_eq!(registry.get(&id("a")).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_running_requires_queued() {
        let registry = JobRegistry::new();
        registry.insert_queued(id("a")).await;
        assert!(registry.mark_cancelled(&id("a")).await);
        assert!(!registry.mark_running(&id("a"), 1).await);
        assert!(!registry.mark_running(&id("missing"), 1).await);
    }

    #[tokio::test]
    async fn test_completed_requires_same_pid() {
        let registry = JobRegistry::new();
        registry.insert_queued(id("a")).await;
        registry.mark_running(&id("a"), 7).await;
        assert!(!registry.mark_completed(&id("a"), 8).await);
        assert_eq!(
            registry.get(&id("a")).await,
            Some(JobStatus::Running { pid: 7 })
        );
    }

    #[tokio::test]
    async fn test_terminal_monotonicity() {
        let registry = JobRegistry::new();
        registry.insert_queued(id("done")).await;
        registry.mark_running(&id("done"), 3).await;
        registry.mark_completed(&id("done"), 3).await;

        assert!(!registry.mark_running(&id("done"), 3).await);
        assert!(!registry.mark_cancelled(&id("done")).await);
        assert!(!registry.mark_not_started(&id("done")).await);
        assert_eq!(registry.get(&id("done")).await, Some(JobStatus::Completed));

        registry.insert_queued(id("killed")).await;
        registry.mark_cancelled(&id("killed")).await;
        assert!(!registry.mark_running(&id("killed"), 4).await);
        assert!(!registry.mark_completed(&id("killed"), 4).await);
        assert_eq!(registry.get(&id("killed")).await, Some(JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_not_started() {
        let registry = JobRegistry::new();
        registry.insert_queued(id("a")).await;
        assert!(registry.mark_not_started(&id("a")).await);
        assert_eq!(registry.get(&id("a")).await, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_insert_if_inactive() {
        let registry = JobRegistry::new();
        let running = |s: &JobStatus| matches!(s, JobStatus::Running { .. });

        assert!(registry.insert_if_inactive(&id("a"), running).await);
        registry.mark_running(&id("a"), 11).await;
        assert!(!registry.insert_if_inactive(&id("a"), running).await);
        assert_eq!(
            registry.get(&id("a")).await,
            Some(JobStatus::Running { pid: 11 })
        );

        // A finished job may start a new lifecycle.
        registry.mark_completed(&id("a"), 11).await;
        assert!(registry.insert_if_inactive(&id("a"), running).await);
        assert_eq!(registry.get(&id("a")).await, Some(JobStatus::Queued));
    }

    #[tokio::test]
    async fn test_remove_if_inactive() {
        let registry = JobRegistry::new();
        registry.insert(id("live"), JobStatus::Running { pid: 1 }).await;
        registry.insert(id("done"), JobStatus::Completed).await;
        let running = |s: &JobStatus| matches!(s, JobStatus::Running { .. });

        assert!(!registry.remove_if_inactive(&id("live"), running).await);
        assert!(registry.remove_if_inactive(&id("done"), running).await);
        assert!(!registry.remove_if_inactive(&id("missing"), running).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_and_snapshot() {
        let registry = JobRegistry::new();
        registry.insert_queued(id("a")).await;
        registry.insert_queued(id("b")).await;
        assert_eq!(registry.len().await, 2);

        assert_eq!(registry.remove(&id("a")).await, Some(JobStatus::Queued));
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot, vec![(id("b"), JobStatus::Queued)]);
        assert!(!registry.is_empty().await);
    }
}
