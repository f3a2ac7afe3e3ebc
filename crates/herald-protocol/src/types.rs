//! Record and error-code types carried inside protocol messages

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single record inside a produce request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    /// Optional partitioning key
    pub key: Option<Bytes>,
    /// Record payload
    pub value: Bytes,
    /// Submission time in milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl WireRecord {
    /// Encoded size used for batch accounting (key + value)
    pub fn size(&self) -> usize {
        self.value.len() + self.key.as_ref().map(|k| k.len()).unwrap_or(0)
    }
}

/// Broker error codes
///
/// **WARNING**: variant order is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The topic does not exist
    UnknownTopic,
    /// The partition does not exist on the topic
    UnknownPartition,
    /// The broker is not the leader for the partition (transient)
    NotLeader,
    /// The broker cannot accept writes right now (transient)
    Unavailable,
    /// The request exceeded a broker quota (transient)
    Throttled,
    /// A record or batch is larger than the broker accepts
    MessageTooLarge,
    /// The request could not be decoded or violated the protocol
    InvalidRequest,
    /// Unexpected broker-side failure
    Internal,
}

impl ErrorCode {
    /// Whether a producer may resend the same batch after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NotLeader | ErrorCode::Unavailable | ErrorCode::Throttled
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::UnknownTopic => "UNKNOWN_TOPIC",
            ErrorCode::UnknownPartition => "UNKNOWN_PARTITION",
            ErrorCode::NotLeader => "NOT_LEADER",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Throttled => "THROTTLED",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}
