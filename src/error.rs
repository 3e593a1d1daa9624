//! Error types for segbridge.

use std::fmt;

use thiserror::Error;

use crate::bridge::SessionState;

/// How a submitted task ended when it did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFailureKind {
    /// The script raised an error inside the worker.
    Failed,
    /// The worker process died or reported a crash.
    Crashed,
    /// The task was abandoned by the caller or by a timeout.
    Canceled,
}

impl fmt::Display for TaskFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::Crashed => write!(f, "crashed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Main error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Worker environment error: {0}")]
    Environment(String),

    #[error("Task {kind}: {message}")]
    TaskExecution {
        kind: TaskFailureKind,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Shared buffer cleanup failed: {cleanup}{}", after_original(.original))]
    ResourceCleanup {
        cleanup: String,
        #[source]
        original: Option<Box<BridgeError>>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Session is {0}; tasks are only accepted while it is ready")]
    NotReady(SessionState),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn after_original(original: &Option<Box<BridgeError>>) -> String {
    match original {
        Some(err) => format!(" (while handling: {err})"),
        None => String::new(),
    }
}

impl BridgeError {
    pub(crate) fn task(kind: TaskFailureKind, message: impl Into<String>) -> Self {
        Self::TaskExecution {
            kind,
            message: message.into(),
        }
    }

    /// The failure kind if this is a task execution error.
    pub fn task_failure(&self) -> Option<TaskFailureKind> {
        match self {
            Self::TaskExecution { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Merge the outcome of an operation with the outcome of its buffer cleanup.
    ///
    /// A failed cleanup is never dropped: it either becomes the error or wraps
    /// the operation's own error.
    pub(crate) fn with_cleanup<T>(result: Result<T>, cleanup: Result<()>) -> Result<T> {
        match (result, cleanup) {
            (result, Ok(())) => result,
            (Ok(_), Err(cleanup)) => Err(Self::ResourceCleanup {
                cleanup: cleanup.to_string(),
                original: None,
            }),
            (Err(original), Err(cleanup)) => Err(Self::ResourceCleanup {
                cleanup: cleanup.to_string(),
                original: Some(Box::new(original)),
            }),
        }
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::io;

    #[test]
    fn test_task_execution_message() {
        let err = BridgeError::task(TaskFailureKind::Crashed, "worker exited with code 1");
        let msg = err.to_string();
        assert!(msg.contains("crashed"));
        assert!(msg.contains("exited with code 1"));
        assert_eq!(err.task_failure(), Some(TaskFailureKind::Crashed));
    }

    #[test]
    fn test_not_ready_message() {
        let err = BridgeError::NotReady(SessionState::Closed);
        assert!(err.to_string().contains("closed"));
        assert_eq!(err.task_failure(), None);
    }

    #[test]
    fn test_cleanup_without_original() {
        let merged: Result<u8> = BridgeError::with_cleanup(
            Ok(1),
            Err(BridgeError::Io(io::Error::other("unlink denied"))),
        );
        let err = merged.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unlink denied"));
        assert!(!msg.contains("while handling"));
        assert!(err.source().is_none());
    }

    #[test]
    fn test_cleanup_wraps_original() {
        let merged: Result<u8> = BridgeError::with_cleanup(
            Err(BridgeError::task(TaskFailureKind::Failed, "NameError")),
            Err(BridgeError::Io(io::Error::other("unlink denied"))),
        );
        let err = merged.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unlink denied"));
        assert!(msg.contains("NameError"));
        let source = err.source().expect("original error kept as source");
        assert!(source.to_string().contains("NameError"));
    }

    #[test]
    fn test_cleanup_success_passes_result_through() {
        let ok: Result<u8> = BridgeError::with_cleanup(Ok(7), Ok(()));
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u8> = BridgeError::with_cleanup(
            Err(BridgeError::Protocol("missing key".into())),
            Ok(()),
        );
        assert!(matches!(err, Err(BridgeError::Protocol(_))));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "python not found");
        let err: BridgeError = io_err.into();
        assert!(err.to_string().contains("python not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let err: BridgeError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }
}
