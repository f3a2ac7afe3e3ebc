//! Records, enqueued messages and delivery outcomes

use crate::error::DeliveryError;
use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Completion callback registered with every published record.
///
/// Invoked exactly once, on the dispatcher task, in submission order per
/// (topic, key).
pub type DeliveryCallback = Box<dyn FnOnce(DeliveryReport) + Send + 'static>;

/// A record submitted by the caller. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Destination topic
    pub topic: String,
    /// Optional key; drives partition selection and ordering lane
    pub key: Option<Bytes>,
    /// Payload
    pub value: Bytes,
}

impl Record {
    pub fn new(topic: impl Into<String>, key: Option<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key,
            value: value.into(),
        }
    }

    /// Bytes counted against batch limits (key + value)
    pub fn size(&self) -> usize {
        self.value.len() + self.key.as_ref().map(|k| k.len()).unwrap_or(0)
    }

    pub(crate) fn lane(&self) -> LaneKey {
        LaneKey {
            topic: self.topic.clone(),
            key: self.key.clone(),
        }
    }
}

/// Destination of a batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Ordering lane: sequence numbers and callback order are per (topic, key).
/// Keyless records of a topic share one lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LaneKey {
    pub topic: String,
    pub key: Option<Bytes>,
}

/// A record owned by the delivery pipeline
#[derive(Debug)]
pub struct EnqueuedMessage {
    pub(crate) record: Record,
    pub(crate) sequence: u64,
    pub(crate) enqueued_at: Instant,
    pub(crate) timestamp_ms: i64,
    pub(crate) retry_count: u32,
}

impl EnqueuedMessage {
    pub(crate) fn new(record: Record, sequence: u64) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            record,
            sequence,
            enqueued_at: Instant::now(),
            timestamp_ms,
            retry_count: 0,
        }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Sequence number within the record's (topic, key) lane
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of failed transmissions so far
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Submission wall-clock time in milliseconds since the Unix epoch
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub(crate) fn size(&self) -> usize {
        self.record.size()
    }
}

/// Broker confirmation for one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    pub topic: String,
    pub partition: u32,
    /// Offset of the first record in the batch
    pub base_offset: u64,
}

impl Acknowledgment {
    /// Offset assigned to the record at `position` within the batch
    pub fn offset_of(&self, position: usize) -> u64 {
        self.base_offset + position as u64
    }
}

/// Terminal state of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { partition: u32, offset: u64 },
    Failed(DeliveryError),
}

/// What a delivery callback receives
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Sequence number within the (topic, key) lane
    pub sequence: u64,
    pub outcome: DeliveryOutcome,
}

impl DeliveryReport {
    pub(crate) fn new(record: Record, sequence: u64, outcome: DeliveryOutcome) -> Self {
        Self {
            topic: record.topic,
            key: record.key,
            value: record.value,
            sequence,
            outcome,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered { .. })
    }

    pub fn partition(&self) -> Option<u32> {
        match self.outcome {
            DeliveryOutcome::Delivered { partition, .. } => Some(partition),
            DeliveryOutcome::Failed(_) => None,
        }
    }

    pub fn offset(&self) -> Option<u64> {
        match self.outcome {
            DeliveryOutcome::Delivered { offset, .. } => Some(offset),
            DeliveryOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&DeliveryError> {
        match &self.outcome {
            DeliveryOutcome::Failed(e) => Some(e),
            DeliveryOutcome::Delivered { .. } => None,
        }
    }

    pub(crate) fn lane(&self) -> LaneKey {
        LaneKey {
            topic: self.topic.clone(),
            key: self.key.clone(),
        }
    }
}

/// Metadata returned by [`Producer::send`](crate::Producer::send)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub sequence: u64,
}
