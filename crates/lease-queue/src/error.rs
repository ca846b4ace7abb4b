//! Error types for queue operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Queue service error ({status} {code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Lease {operation} failed for receipt '{receipt}': {message}")]
    LeaseCallbackFailure {
        operation: LeaseOperation,
        receipt: String,
        message: String,
    },

    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),

    #[error("No message received within {timeout:?}")]
    DeadlineElapsed { timeout: Duration },
}

impl QueueError {
    /// Check if a failed receive is transient and should be retried
    ///
    /// Service failures of any status, connection failures and malformed
    /// responses are retried by pop; configuration problems and a
    /// multi-message response are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Configuration(_) => false,
            Self::Service { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::ProtocolViolation { .. } => false,
            Self::MalformedResponse { .. } => true,
            Self::Serialization(_) => false,
            Self::LeaseCallbackFailure { .. } => false,
            Self::InvalidQueueName(_) => false,
            Self::DeadlineElapsed { .. } => false,
        }
    }

    pub(crate) fn malformed(detail: impl std::fmt::Display) -> Self {
        Self::MalformedResponse {
            message: detail.to_string(),
        }
    }
}

/// The terminal call issued on behalf of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOperation {
    Commit,
    Release,
}

impl std::fmt::Display for LeaseOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Commit => write!(f, "commit"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message body is not a valid escaped payload: {message}")]
    Encoding { message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigurationError {
    pub(crate) fn missing(key: &str) -> Self {
        Self::Missing {
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
