//! Error types for the drover job execution subsystem.

use thiserror::Error;

/// The main error type for drover.
#[derive(Error, Debug)]
pub enum DroverError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key-value store error (connection or command failure).
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The queue has been shut down and no longer accepts work.
    #[error("Queue closed: {0}")]
    QueueClosed(String),

    /// Spawning, signalling or waiting on an OS process failed.
    #[error("Process error: {0}")]
    Process(String),

    /// Opening or closing a job session failed.
    #[error("Session error: {0}")]
    Session(String),

    /// Timeout error.
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result type alias using DroverError.
pub type Result<T> = std::result::Result<T, DroverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_serialization() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err = DroverError::Serialization(json_err);
        let display = format!("{}", err);
        assert!(display.starts_with("Serialization error:"));
    }

    #[test]
    fn test_error_display_store() {
        let err = DroverError::Store("connection refused".to_string());
        assert_eq!(format!("{}", err), "Store error: connection refused");
    }

    #[test]
    fn test_error_display_job_not_found() {
        let err = DroverError::JobNotFound("block_run_42".to_string());
        assert_eq!(format!("{}", err), "Job not found: block_run_42");
    }

    #[test]
    fn test_error_display_queue_closed() {
        let err = DroverError::QueueClosed("shutting down".to_string());
        assert_eq!(format!("{}", err), "Queue closed: shutting down");
    }

    #[test]
    fn test_error_display_process() {
        let err = DroverError::Process("no such file".to_string());
        assert_eq!(format!("{}", err), "Process error: no such file");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: DroverError = json_err.into();
        assert!(matches!(err, DroverError::Serialization(_)));
    }
}
