//! Protocol error types

use thiserror::Error;

/// Protocol error types
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Frame exceeds [`MAX_MESSAGE_SIZE`](crate::MAX_MESSAGE_SIZE)
    #[error("Message size {0} exceeds maximum {1}")]
    MessageTooLarge(usize, usize),

    /// Frame is shorter than its fixed header
    #[error("Truncated frame: {0} bytes")]
    TruncatedFrame(usize),
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
