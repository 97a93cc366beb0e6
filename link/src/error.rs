//! Error types for mq-link

use thiserror::Error;

/// Errors that can occur in mq-link client operations
#[derive(Error, Debug)]
pub enum MqLinkError {
    /// Socket or protocol failure reported by the underlying transport
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Operation requires an established broker connection
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Outbound payload could not be serialized
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Inbound payload was not a well-formed envelope
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// A message handler returned an error or panicked
    #[error("Handler error: {0}")]
    HandlerError(String),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Operation did not complete in time
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// A reply destination is already owned by a pending RPC call
    #[error("Reply destination already in use: {0}")]
    DuplicateReplyDestination(String),

    /// The background connection task is gone
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Operation was withdrawn before it could complete
    #[error("Operation cancelled")]
    Cancelled,
}

impl MqLinkError {
    /// Wrap any displayable handler failure.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        MqLinkError::HandlerError(err.to_string())
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MqLinkError::TransportError(_)
                | MqLinkError::NotConnected(_)
                | MqLinkError::TimeoutError(_)
        )
    }
}

impl From<serde_json::Error> for MqLinkError {
    fn from(err: serde_json::Error) -> Self {
        MqLinkError::SerializationError(err.to_string())
    }
}

/// Result type for mq-link operations
pub type Result<T> = std::result::Result<T, MqLinkError>;
