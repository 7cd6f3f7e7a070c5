//! Error types for Ferry core

use std::path::PathBuf;

use ferry_types::{ErrorCode, StateError, TaskKey, UpdatedInfo};
use thiserror::Error;

/// Errors that can occur in Ferry core
#[derive(Debug, Error)]
pub enum FerryError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Address {0} is temporarily blacklisted")]
    Blacklisted(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Connection lost")]
    Disconnected,

    #[error("Task failed: {0}")]
    BusinessRule(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transfer not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transfer was stopped")]
    Stopped,

    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("Shutting down")]
    Shutdown,

    #[error("Transfer {key} failed ({code})")]
    TransferFailed { key: TaskKey, code: ErrorCode },

    #[error("Remote error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Request refused ({code}): {message}")]
    Refused { code: ErrorCode, message: String },

    #[error("Timeout")]
    Timeout,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FerryError>;

impl FerryError {
    /// Check if the Commander should try again after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            FerryError::Connection(_) | FerryError::Blacklisted(_) | FerryError::Timeout => true,
            FerryError::Remote { code, .. } => *code == ErrorCode::ServerOverloaded,
            _ => false,
        }
    }

    /// Status code reported to the peer and stored on the runner
    pub fn code(&self) -> ErrorCode {
        match self {
            FerryError::Connection(_) | FerryError::Blacklisted(_) | FerryError::Timeout => {
                ErrorCode::ConnectionImpossible
            }
            FerryError::Authentication(_) => ErrorCode::BadAuthent,
            FerryError::Protocol(_) | FerryError::InvalidOperation(_) => ErrorCode::IncorrectCommand,
            FerryError::Integrity { .. } => ErrorCode::Md5Error,
            FerryError::Io(_) => ErrorCode::TransferError,
            FerryError::FileNotFound(_) => ErrorCode::FileNotFound,
            FerryError::Disconnected => ErrorCode::Disconnection,
            FerryError::BusinessRule(_) => ErrorCode::ExternalOp,
            FerryError::Database(_) | FerryError::Serialization(_) | FerryError::Config(_) => {
                ErrorCode::Internal
            }
            FerryError::NotFound(_) => ErrorCode::QueryRemotelyUnknown,
            FerryError::Conflict(_) => ErrorCode::QueryStillRunning,
            FerryError::Stopped => ErrorCode::StoppedTransfer,
            FerryError::Cancelled => ErrorCode::CanceledTransfer,
            FerryError::Shutdown => ErrorCode::Shutdown,
            FerryError::TransferFailed { code, .. }
            | FerryError::Remote { code, .. }
            | FerryError::Refused { code, .. } => *code,
        }
    }

    /// State a runner ends in when its transfer fails with this error.
    ///
    /// Resumable failures leave it INTERRUPTED, everything else is final.
    pub fn outcome(&self) -> UpdatedInfo {
        match self.code() {
            ErrorCode::TransferError
            | ErrorCode::Disconnection
            | ErrorCode::StoppedTransfer
            | ErrorCode::Shutdown
            | ErrorCode::RemoteShutdown => UpdatedInfo::Interrupted,
            _ => UpdatedInfo::InError,
        }
    }

    /// Build the error matching a code received from the peer.
    pub fn from_remote(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::BadAuthent => FerryError::Authentication(message),
            ErrorCode::StoppedTransfer => FerryError::Stopped,
            ErrorCode::CanceledTransfer => FerryError::Cancelled,
            ErrorCode::Shutdown => FerryError::Remote {
                code: ErrorCode::RemoteShutdown,
                message,
            },
            code => FerryError::Remote { code, message },
        }
    }

    /// Local refusal reported to the peer under `code`
    pub fn refused(code: ErrorCode, message: impl Into<String>) -> Self {
        FerryError::Refused {
            code,
            message: message.into(),
        }
    }
}

impl From<StateError> for FerryError {
    fn from(error: StateError) -> Self {
        FerryError::InvalidOperation(error.to_string())
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(error: serde_json::Error) -> Self {
        FerryError::Serialization(error.to_string())
    }
}

// Allow converting to String for CLI output
impl From<FerryError> for String {
    fn from(error: FerryError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumable_failures_are_interrupted() {
        assert_eq!(FerryError::Stopped.outcome(), UpdatedInfo::Interrupted);
        assert_eq!(FerryError::Disconnected.outcome(), UpdatedInfo::Interrupted);
        assert_eq!(
            FerryError::Io(std::io::Error::other("disk")).outcome(),
            UpdatedInfo::Interrupted
        );
        assert_eq!(FerryError::Cancelled.outcome(), UpdatedInfo::InError);
        assert_eq!(
            FerryError::Integrity {
                expected: "a".into(),
                actual: "b".into()
            }
            .outcome(),
            UpdatedInfo::InError
        );
        assert_eq!(FerryError::Authentication("bad key".into()).outcome(), UpdatedInfo::InError);
    }

    #[test]
    fn only_connection_errors_retry() {
        assert!(FerryError::Connection("refused".into()).is_retryable());
        assert!(FerryError::Blacklisted("10.0.0.1".into()).is_retryable());
        assert!(!FerryError::Authentication("bad key".into()).is_retryable());
        assert!(!FerryError::Protocol("unexpected packet".into()).is_retryable());
    }

    #[test]
    fn remote_codes_map_back() {
        assert!(matches!(
            FerryError::from_remote(ErrorCode::BadAuthent, "no"),
            FerryError::Authentication(_)
        ));
        assert!(matches!(
            FerryError::from_remote(ErrorCode::CanceledTransfer, ""),
            FerryError::Cancelled
        ));
        assert_eq!(
            FerryError::from_remote(ErrorCode::Shutdown, "").code(),
            ErrorCode::RemoteShutdown
        );
    }
}
