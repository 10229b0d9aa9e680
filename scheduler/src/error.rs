//! Error types for the observatory scheduler
//!
//! Most runtime failures (constraint violations, subsystem timeouts, lost
//! connections) never surface as errors: they are absorbed by moving a job
//! or the scheduler into another state. The variants here cover what is left,
//! mostly user input and queue file handling that is rejected up front.

use crate::job::JobId;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type of the scheduler crate
#[derive(Error, Debug)]
pub enum SchedulerError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Startup script is not valid: {}", .0.display())]
    InvalidStartupScript(PathBuf),

    #[error("Shutdown script is not valid: {}", .0.display())]
    InvalidShutdownScript(PathBuf),

    // =========================================================================
    // Queue Errors
    // =========================================================================

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid job '{name}': {reason}")]
    InvalidJob {
        name: String,
        reason: String,
    },

    #[error("Sequence '{}' is not accessible: {reason}", path.display())]
    SequenceUnavailable {
        path: PathBuf,
        reason: String,
    },

    /// The queue cannot be edited while the scheduler runs
    #[error("Scheduler is busy: {0}")]
    Busy(String),

    // =========================================================================
    // System Errors
    // =========================================================================

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Scheduler task is not running")]
    TaskStopped,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SchedulerError::InvalidJob {
            name: "M31".to_string(),
            reason: "missing sequence".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid job 'M31': missing sequence");

        let err = SchedulerError::InvalidStartupScript(PathBuf::from("/tmp/start.sh"));
        assert_eq!(err.to_string(), "Startup script is not valid: /tmp/start.sh");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SchedulerError = io.into();
        assert!(matches!(err, SchedulerError::Io(_)));
    }
}
