//! Launching job target processes.

use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

use crate::error::{DroverError, Result};
use crate::job::JobTarget;

/// How one execution of a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The process exited with status 0.
    Succeeded,
    /// The process exited non-zero or was killed by a signal.
    Failed {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    /// The process could not be started.
    NotStarted { reason: String },
    /// The job was no longer queued when a worker picked it up.
    Skipped,
}

impl JobOutcome {
    /// Build an outcome from a process exit status.
    pub fn from_exit_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if status.success() {
            JobOutcome::Succeeded
        } else {
            JobOutcome::Failed {
                exit_code: status.code(),
                signal: status.signal(),
            }
        }
    }

    /// Whether the target ran to a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }

    /// Short label used in logs and run ledgers.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed { signal: Some(_), .. } => "killed",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::NotStarted { .. } => "not_started",
            JobOutcome::Skipped => "skipped",
        }
    }
}

/// Spawn the process for `target`, with `extra_env` layered over its kwargs.
///
/// Stdin is closed; stdout and stderr are inherited so job output lands in
/// the worker's own log stream.
pub fn spawn_target(target: &JobTarget, extra_env: &[(String, String)]) -> Result<Child> {
    let mut command = Command::new(&target.program);
    command
        .args(&target.args)
        .envs(&target.kwargs)
        .envs(extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if let Some(dir) = &target.current_dir {
        command.current_dir(dir);
    }

    command
        .spawn()
        .map_err(|e| DroverError::Process(format!("failed to spawn {}: {}", target.program, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_success() {
        let mut child = spawn_target(&JobTarget::new("true"), &[]).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(JobOutcome::from_exit_status(status), JobOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_spawn_failure_exit_code() {
        let mut child = spawn_target(&JobTarget::shell("exit 3"), &[]).unwrap();
        let outcome = JobOutcome::from_exit_status(child.wait().await.unwrap());
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                exit_code: Some(3),
                signal: None
            }
        );
        assert_eq!(outcome.label(), "failed");
    }

    #[tokio::test]
    async fn test_kwargs_and_extra_env_are_exported() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let target = JobTarget::shell(format!("echo \"$PIPELINE-$RUN_ID\" > {}", out.display()))
            .kwarg("PIPELINE", "etl");
        let mut child =
            spawn_target(&target, &[("RUN_ID".to_string(), "7".to_string())]).unwrap();
        child.wait().await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "etl-7");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = spawn_target(&JobTarget::new("/nonexistent/drover-test-binary"), &[]).unwrap_err();
        assert!(matches!(err, DroverError::Process(_)));
    }
}
