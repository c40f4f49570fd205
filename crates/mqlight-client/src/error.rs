//! Client error types.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Client error type.
///
/// Errors are `Clone` so a single failure can be reported to every listener
/// waiting on the affected operations.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// An argument failed validation. Raised synchronously.
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// The operation is not allowed in the client's current state.
    #[error("Invalid state: {0}")]
    State(String),

    #[error("Network error: {0}")]
    Network(String),

    /// Another client connected with the same identifier.
    #[error("Client replaced: {0}")]
    Replaced(String),

    #[error("Security error: {0}")]
    Security(String),

    /// A promise or confirmation was used incorrectly.
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] mqlight_core::ProtocolError),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(e: config::ConfigError) -> Self {
        ClientError::Config(e.to_string())
    }
}

impl ClientError {
    /// Whether the client should keep retrying after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Network(_) | ClientError::Protocol(_) | ClientError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::Network("reset".into()).is_retryable());
        assert!(ClientError::from(io::Error::from(io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(!ClientError::Security("bad cert".into()).is_retryable());
        assert!(!ClientError::Replaced("dup".into()).is_retryable());
        assert!(!ClientError::Argument("x".into()).is_retryable());
    }

    #[test]
    fn test_io_error_is_cloneable() {
        let err = ClientError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert_eq!(copy.to_string(), "I/O error: boom");
    }
}
