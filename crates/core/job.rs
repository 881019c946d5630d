//! Job definition and related types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Caller-supplied identifier for a job.
///
/// The queue never generates ids: the caller picks one that stays stable for
/// the lifetime of the unit of work (e.g. `block_run_42`) so duplicate
/// enqueues can be detected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Create a JobId from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What a job runs: an executable with positional and keyword arguments.
///
/// Positional arguments become the process argv; keyword arguments are
/// exported to the process environment. The queue passes both through
/// without looking at them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTarget {
    /// Program to execute (resolved through `PATH` when not absolute).
    pub program: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Keyword arguments, exported as environment variables.
    #[serde(default)]
    pub kwargs: BTreeMap<String, String>,
    /// Working directory for the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dir: Option<PathBuf>,
}

impl JobTarget {
    /// Create a target for the given program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            current_dir: None,
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several positional arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Shorthand for `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }
}

/// The status of a job in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue for a worker.
    Queued,
    /// Executing in the process with this PID.
    Running { pid: u32 },
    /// Execution finished, successfully or not.
    Completed,
    /// Forced to stop before or during execution.
    Cancelled,
}

impl JobStatus {
    /// Whether no further transition may happen from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// The owning PID, if running.
    pub fn pid(&self) -> Option<u32> {
        match self {
            JobStatus::Running { pid } => Some(*pid),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running { pid } => write!(f, "running({})", pid),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work: an id plus the target it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied job identifier.
    pub id: JobId,
    /// The target to execute.
    pub target: JobTarget,
    /// Timestamp when the job was enqueued (Unix timestamp in seconds).
    pub enqueued_at: i64,
}

impl Job {
    /// Create a new job.
    pub fn new(id: impl Into<JobId>, target: JobTarget) -> Self {
        Self {
            id: id.into(),
            target,
            enqueued_at: current_timestamp(),
        }
    }

    /// Serialize the job to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a job from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Get current Unix timestamp in seconds.
pub(crate) fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_creation() {
        let job = Job::new("block_run_42", JobTarget::new("echo").arg("hi"));
        assert_eq!(job.id.as_str(), "block_run_42");
        assert_eq!(job.target.args, vec!["hi".to_string()]);
        assert!(job.enqueued_at > 1577836800);
    }

    #[test]
    fn test_job_serialization() {
        let job = Job::new(
            "pipeline_7",
            JobTarget::new("python3")
                .args(["-m", "runner"])
                .kwarg("PIPELINE_UUID", "abc"),
        );
        let json = job.to_json().unwrap();
        let deserialized = Job::from_json(&json).unwrap();
        assert_eq!(deserialized, job);
    }

    #[test]
    fn test_target_shell() {
        let target = JobTarget::shell("exit 3");
        assert_eq!(target.program, "sh");
        assert_eq!(target.args, vec!["-c".to_string(), "exit 3".to_string()]);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running { pid: 10 }.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_pid() {
        assert_eq!(JobStatus::Running { pid: 77 }.pid(), Some(77));
        assert_eq!(JobStatus::Queued.pid(), None);
    }

    #[test]
    fn test_status_serde_tagged() {
        let json = serde_json::to_string(&JobStatus::Running { pid: 5 }).unwrap();
        assert_eq!(json, r#"{"state":"running","pid":5}"#);
        let back: JobStatus = serde_json::from_str(r#"{"state":"cancelled"}"#).unwrap();
        assert_eq!(back, JobStatus::Cancelled);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::Running { pid: 9 }.to_string(), "running(9)");
        assert_eq!(JobStatus::Queued.to_string(), "queued");
    }
}
