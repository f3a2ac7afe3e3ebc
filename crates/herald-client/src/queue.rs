//! Bounded, per-partition delivery queue
//!
//! Records wait here between submission and transmission. Each destination
//! partition has its own FIFO buffer with a fixed record capacity; a full
//! buffer rejects the submission with [`Error::QueueFull`] instead of
//! blocking the caller.
//!
//! Sequence numbers are allocated per (topic, key) lane at enqueue time, and
//! the delivery callback is registered with the dispatcher in the same
//! critical section, so registration order always matches sequence order.

use crate::batcher::{Batch, BatchLimits};
use crate::dispatcher::DispatcherHandle;
use crate::record::{DeliveryCallback, EnqueuedMessage, LaneKey, Record, TopicPartition};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

// ============================================================================
// Partition queue
// ============================================================================

#[derive(Default)]
struct PartitionState {
    messages: VecDeque<EnqueuedMessage>,
    /// Key + value bytes of everything in `messages`
    bytes: usize,
    closed: bool,
}

/// FIFO buffer for one destination partition
pub(crate) struct PartitionQueue {
    tp: TopicPartition,
    state: Mutex<PartitionState>,
    notify: Notify,
}

impl PartitionQueue {
    fn new(tp: TopicPartition) -> Self {
        Self {
            tp,
            state: Mutex::new(PartitionState::default()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Submission time of the message at the head of the queue
    pub(crate) fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.state.lock().messages.front().map(|m| m.enqueued_at)
    }

    /// Whether enough is queued to fill a batch without lingering
    pub(crate) fn has_full_batch(&self, limits: BatchLimits) -> bool {
        let state = self.state.lock();
        state.messages.len() >= limits.max_count || state.bytes >= limits.max_bytes
    }

    /// Resolves when a message is enqueued or requeued
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Take messages from the head of the queue without waiting.
    ///
    /// Returns an empty batch when nothing is queued. A non-empty queue always
    /// yields at least one message, even one larger than `max_bytes`.
    pub(crate) fn drain(&self, limits: BatchLimits) -> Batch {
        let mut state = self.state.lock();
        let mut messages = Vec::new();
        let mut size = 0usize;

        while let Some(front) = state.messages.front() {
            if !messages.is_empty()
                && (messages.len() >= limits.max_count || size + front.size() > limits.max_bytes)
            {
                break;
            }
            let Some(message) = state.messages.pop_front() else {
                break;
            };
            size += message.size();
            state.bytes -= message.size();
            messages.push(message);
        }

        Batch::from_messages(self.tp.clone(), messages)
    }

    /// Put retried messages back at the head, in their original order.
    ///
    /// Capacity is not checked: these messages were already admitted.
    pub(crate) fn requeue_front(&self, messages: Vec<EnqueuedMessage>) {
        if messages.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            for message in messages.into_iter().rev() {
                state.bytes += message.size();
                state.messages.push_front(message);
            }
        }
        self.notify.notify_one();
    }

    /// Remove everything still queued
    pub(crate) fn take_all(&self) -> Vec<EnqueuedMessage> {
        let mut state = self.state.lock();
        state.bytes = 0;
        state.messages.drain(..).collect()
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}

// ============================================================================
// Delivery queue
// ============================================================================

#[derive(Default)]
struct QueueMap {
    queues: HashMap<TopicPartition, Arc<PartitionQueue>>,
    closed: bool,
}

/// All partition queues of one producer
pub(crate) struct DeliveryQueue {
    capacity: usize,
    partitions: Mutex<QueueMap>,
    /// Next sequence number per ordering lane
    sequences: Mutex<HashMap<LaneKey, u64>>,
    dispatcher: DispatcherHandle,
}

impl DeliveryQueue {
    pub(crate) fn new(capacity: usize, dispatcher: DispatcherHandle) -> Self {
        Self {
            capacity,
            partitions: Mutex::new(QueueMap::default()),
            sequences: Mutex::new(HashMap::new()),
            dispatcher,
        }
    }

    /// Look up the queue for `tp`, creating it on first use.
    ///
    /// `on_create` runs under the map lock for a newly created queue, so it is
    /// called at most once per partition.
    pub(crate) fn get_or_create(
        &self,
        tp: &TopicPartition,
        on_create: impl FnOnce(Arc<PartitionQueue>),
    ) -> Result<Arc<PartitionQueue>> {
        let mut map = self.partitions.lock();
        if map.closed {
            return Err(Error::Cancelled);
        }
        if let Some(queue) = map.queues.get(tp) {
            return Ok(Arc::clone(queue));
        }

        let queue = Arc::new(PartitionQueue::new(tp.clone()));
        map.queues.insert(tp.clone(), Arc::clone(&queue));
        debug!("Created delivery queue for {}", tp);
        on_create(Arc::clone(&queue));
        Ok(queue)
    }

    /// Append a record to `queue` and register its callback.
    ///
    /// A full or closed queue is left untouched: no sequence number is
    /// consumed and the callback is dropped without being registered.
    pub(crate) fn enqueue(
        &self,
        queue: &PartitionQueue,
        record: Record,
        callback: DeliveryCallback,
    ) -> Result<u64> {
        let mut state = queue.state.lock();
        if state.closed {
            return Err(Error::Cancelled);
        }
        if state.messages.len() >= self.capacity {
            return Err(Error::QueueFull {
                topic: queue.tp.topic.clone(),
                partition: queue.tp.partition,
                capacity: self.capacity,
            });
        }

        let lane = record.lane();
        let sequence = {
            let mut sequences = self.sequences.lock();
            let next = sequences.entry(lane.clone()).or_insert(0);
            let sequence = *next;
            *next += 1;
            self.dispatcher.register(lane, sequence, callback);
            sequence
        };

        state.bytes += record.size();
        state.messages.push_back(EnqueuedMessage::new(record, sequence));
        drop(state);

        queue.notify.notify_one();
        Ok(sequence)
    }

    /// Reject all further submissions
    pub(crate) fn close(&self) {
        let mut map = self.partitions.lock();
        map.closed = true;
        for queue in map.queues.values() {
            queue.close();
        }
    }

    pub(crate) fn partitions(&self) -> Vec<Arc<PartitionQueue>> {
        self.partitions.lock().queues.values().cloned().collect()
    }

    /// Records queued across all partitions
    pub(crate) fn queued(&self) -> usize {
        self.partitions
            .lock()
            .queues
            .values()
            .map(|q| q.len())
            .sum()
    }
}
