//! Batch assembly
//!
//! A [`Batcher`] turns the contents of one partition queue into batches that
//! respect the configured byte and record limits. A partial batch is held
//! back until its oldest record has waited for the linger time; once the
//! producer starts draining for shutdown, linger is skipped.

use crate::queue::PartitionQueue;
use crate::record::{EnqueuedMessage, Record, TopicPartition};
use herald_protocol::WireRecord;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Producer lifecycle, broadcast to partition pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Running,
    /// Closed to new records; flush what is queued without lingering
    Draining,
    /// Stop now; leftovers are cancelled
    Terminated,
}

/// Upper bounds for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_bytes: usize,
    pub max_count: usize,
}

/// Ordered group of messages for a single partition
#[derive(Debug)]
pub struct Batch {
    tp: TopicPartition,
    messages: Vec<EnqueuedMessage>,
    size_bytes: usize,
}

impl Batch {
    pub(crate) fn from_messages(tp: TopicPartition, messages: Vec<EnqueuedMessage>) -> Self {
        let size_bytes = messages.iter().map(|m| m.size()).sum();
        Self {
            tp,
            messages,
            size_bytes,
        }
    }

    pub fn topic(&self) -> &str {
        &self.tp.topic
    }

    pub fn partition(&self) -> u32 {
        self.tp.partition
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    /// Messages in submission order
    pub fn messages(&self) -> &[EnqueuedMessage] {
        &self.messages
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.messages.iter().map(|m| m.record())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Key + value bytes of all records
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Records in wire form, timestamps included
    pub fn wire_records(&self) -> Vec<WireRecord> {
        self.messages
            .iter()
            .map(|m| WireRecord {
                key: m.record.key.clone(),
                value: m.record.value.clone(),
                timestamp: m.timestamp_ms,
            })
            .collect()
    }

    pub(crate) fn into_messages(self) -> Vec<EnqueuedMessage> {
        self.messages
    }
}

/// Waits for a partition queue to hold a sendable batch
pub(crate) struct Batcher {
    limits: BatchLimits,
    linger: Duration,
}

impl Batcher {
    pub(crate) fn new(limits: BatchLimits, linger: Duration) -> Self {
        Self { limits, linger }
    }

    /// Next batch for `queue`, or `None` once the pipeline should stop.
    ///
    /// A batch is released as soon as it is full, when the oldest queued
    /// record has lingered long enough, or immediately while draining. The
    /// pipeline stops on termination, or when draining finds the queue empty.
    pub(crate) async fn next_batch(
        &self,
        queue: &PartitionQueue,
        lifecycle: &mut watch::Receiver<Lifecycle>,
    ) -> Option<Batch> {
        loop {
            let state = *lifecycle.borrow_and_update();
            if state == Lifecycle::Terminated {
                return None;
            }
            let draining = state == Lifecycle::Draining;

            let Some(oldest) = queue.oldest_enqueued_at() else {
                if draining {
                    return None;
                }
                tokio::select! {
                    _ = queue.notified() => {}
                    changed = lifecycle.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                }
                continue;
            };

            let deadline = oldest + self.linger;
            if draining || queue.has_full_batch(self.limits) || Instant::now() >= deadline {
                let batch = queue.drain(self.limits);
                if !batch.is_empty() {
                    return Some(batch);
                }
                continue;
            }

            tokio::select! {
                _ = queue.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
                changed = lifecycle.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
