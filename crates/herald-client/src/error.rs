use thiserror::Error;

/// Errors returned synchronously by the producer API
#[derive(Error, Debug)]
pub enum Error {
    /// The target partition's buffer is at capacity; back off or drop
    #[error("Queue full for {topic}/{partition} (capacity {capacity})")]
    QueueFull {
        topic: String,
        partition: u32,
        capacity: usize,
    },

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The producer is shutting down or already closed
    #[error("Cancelled: producer is closed")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid partition {partition} for topic '{topic}' ({partitions} partitions)")]
    InvalidPartition {
        topic: String,
        partition: u32,
        partitions: u32,
    },

    /// Terminal delivery failure surfaced by [`Producer::send`](crate::Producer::send)
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a broker collaborator.
///
/// `retryable` errors (connection loss, leader moves, timeouts) are handled by
/// the retry controller and never reach the caller directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    /// A transient failure; the batch may be resent
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; the batch must not be resent
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Failure to turn a structured record into a payload
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization failed: {0}")]
    Custom(String),
}

/// Terminal failure of a single message, delivered through its callback
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The broker rejected the batch with a non-retryable error
    #[error("Rejected by broker: {0}")]
    Rejected(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The producer was closed before the message could be delivered
    #[error("Cancelled: producer closed before delivery")]
    Cancelled,
}
