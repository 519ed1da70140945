//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// None of these are fatal to a viewer session: envelope and scope errors are
/// recovered locally (drop and log), sync errors are surfaced while local
/// state stays advanced.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed envelope for kind {kind}: {reason}")]
    MalformedEnvelope { kind: String, reason: String },

    #[error("Invalid notification identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Remote sync failed during {operation}: {message}")]
    RemoteSyncFailure { operation: String, message: String },

    #[error("Viewer scope unavailable: {0}")]
    ScopeUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn malformed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    pub fn remote_sync(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteSyncFailure {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether a later backfill or reconnect can heal the condition.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}
