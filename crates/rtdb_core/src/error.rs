//! Error types for the synchronization core.

use rtdb_node::NodeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for synchronous API calls.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned directly by API calls.
///
/// Outcomes of operations that complete later (writes, transactions,
/// listens) are reported through callbacks as [`DatabaseError`].
#[derive(Error, Debug)]
pub enum CoreError {
    /// A key, path or value supplied by the caller is invalid.
    #[error(transparent)]
    InvalidInput(#[from] NodeError),

    /// An argument is invalid for the requested operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The run loop has stopped and no longer accepts tasks.
    #[error("run loop {name:?} is not running")]
    RunLoopStopped {
        /// Name of the stopped loop.
        name: String,
    },

    /// A repo for this location already exists.
    #[error("a repo for {0} already exists")]
    RepoAlreadyExists(String),

    /// No repo exists for this location.
    #[error("no repo for {0}")]
    RepoNotFound(String),

    /// The run loop failed to start.
    #[error("failed to start run loop: {0}")]
    Spawn(#[from] std::io::Error),

    /// Waiting for the run loop timed out.
    #[error("operation timed out")]
    Timeout,
}

impl CoreError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Classifies a [`DatabaseError`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The operation was aborted because the connection was lost.
    Disconnected,
    /// A transaction was superseded by a set on an overlapping path.
    OverriddenBySet,
    /// A transaction hit the retry ceiling.
    MaxRetries,
    /// A transaction handler panicked.
    UserCodeException,
    /// The server denied access.
    PermissionDenied,
    /// The server's data changed since it was read.
    DataStale,
    /// The server is unavailable.
    Unavailable,
    /// Any other server code, passed through verbatim.
    Other(String),
}

impl ErrorCode {
    /// Maps a server error code string to a code.
    pub fn from_server_code(code: &str) -> Self {
        match code {
            "permission_denied" => ErrorCode::PermissionDenied,
            "datastale" => ErrorCode::DataStale,
            "unavailable" => ErrorCode::Unavailable,
            "disconnected" => ErrorCode::Disconnected,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    fn default_message(&self) -> &str {
        match self {
            ErrorCode::Disconnected => "The operation had to be aborted due to a network disconnect",
            ErrorCode::OverriddenBySet => "The transaction was overridden by a subsequent set",
            ErrorCode::MaxRetries => "The transaction had too many retries",
            ErrorCode::UserCodeException => "User code called from the database runloop threw an exception",
            ErrorCode::PermissionDenied => "Client doesn't have permission to access the desired data",
            ErrorCode::DataStale => "The transaction needs to be run again with current data",
            ErrorCode::Unavailable => "The service is unavailable",
            ErrorCode::Other(_) => "The server rejected the operation",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Disconnected => f.write_str("disconnected"),
            ErrorCode::OverriddenBySet => f.write_str("overridden_by_set"),
            ErrorCode::MaxRetries => f.write_str("max_retries"),
            ErrorCode::UserCodeException => f.write_str("user_code_exception"),
            ErrorCode::PermissionDenied => f.write_str("permission_denied"),
            ErrorCode::DataStale => f.write_str("datastale"),
            ErrorCode::Unavailable => f.write_str("unavailable"),
            ErrorCode::Other(code) => f.write_str(code),
        }
    }
}

/// An error delivered to a completion or cancellation callback.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct DatabaseError {
    /// What went wrong.
    pub code: ErrorCode,
    /// Human readable detail.
    pub message: String,
}

impl DatabaseError {
    /// Creates an error with the default message for `code`.
    pub fn from_code(code: ErrorCode) -> Self {
        let message = code.default_message().to_string();
        Self { code, message }
    }

    /// Creates an error with an explicit message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an error from a server rejection.
    pub fn from_server(code: &str, message: Option<&str>) -> Self {
        let code = ErrorCode::from_server_code(code);
        match message {
            Some(message) => Self::with_message(code, message),
            None => Self::from_code(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_codes_map_to_known_variants() {
        assert_eq!(ErrorCode::from_server_code("permission_denied"), ErrorCode::PermissionDenied);
        assert_eq!(ErrorCode::from_server_code("datastale"), ErrorCode::DataStale);
        assert_eq!(
            ErrorCode::from_server_code("too_big"),
            ErrorCode::Other("too_big".into())
        );
    }

    #[test]
    fn error_display() {
        let err = DatabaseError::from_code(ErrorCode::MaxRetries);
        assert_eq!(
            err.to_string(),
            "max_retries: The transaction had too many retries"
        );

        let err = DatabaseError::from_server("too_big", Some("payload too large"));
        assert_eq!(err.to_string(), "too_big: payload too large");

        let err = CoreError::RunLoopStopped { name: "repo".into() };
        assert!(err.to_string().contains("repo"));
    }

    #[test]
    fn node_errors_convert() {
        let err: CoreError = rtdb_node::Path::parse("a/b.c").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidInput(NodeError::InvalidPath { .. })));
    }
}
