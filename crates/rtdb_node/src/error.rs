//! Error types for the node crate.

use thiserror::Error;

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors raised while building nodes, keys or paths from user input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// A child key is not allowed.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A path is not allowed.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A JSON value cannot be represented as a node.
    #[error("invalid value at {path}: {reason}")]
    InvalidValue {
        /// Location of the bad value inside the document.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A priority is neither null, a number nor a string.
    #[error("invalid priority: {0}")]
    InvalidPriority(String),
}

impl NodeError {
    /// Create an invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid value error.
    pub fn invalid_value(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
