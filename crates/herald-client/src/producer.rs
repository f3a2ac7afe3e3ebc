//! Asynchronous, ordered, at-least-once producer
//!
//! [`Producer`] accepts records without waiting for the broker. Each record
//! is routed to a partition, buffered in that partition's bounded queue and
//! sent in batches by a pipeline task dedicated to the partition. Retryable
//! failures are resent with exponential backoff; every record ends with
//! exactly one callback, and callbacks for the same (topic, key) fire in the
//! order the records were submitted.
//!
//! # Example
//!
//! ```rust,ignore
//! use herald_client::{Producer, ProducerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> herald_client::Result<()> {
//! let config = ProducerConfig::builder()
//!     .bootstrap_servers(vec!["localhost:9092".to_string()])
//!     .linger_ms(5)
//!     .build();
//!
//! let producer = Producer::new(config).await?;
//! producer
//!     .publish("orders", Some("user02".into()), "{\"quantity\":1}", |report| {
//!         println!("{}/{:?} -> {:?}", report.topic, report.partition(), report.offset());
//!     })
//!     .await?;
//!
//! producer.flush().await?;
//! producer.close(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

use crate::batcher::{Batch, BatchLimits, Batcher, Lifecycle};
use crate::config::ProducerConfig;
use crate::dispatcher::{self, DispatcherHandle};
use crate::error::DeliveryError;
use crate::metadata::{Lookup, MetadataCache};
use crate::partitioner::Partitioner;
use crate::queue::{DeliveryQueue, PartitionQueue};
use crate::record::{
    Acknowledgment, DeliveryCallback, DeliveryOutcome, DeliveryReport, Record, RecordMetadata,
    TopicPartition,
};
use crate::retry::RetryPolicy;
use crate::serializer::Serializer;
use crate::tcp::TcpConnectionFactory;
use crate::transport::{ConnectionFactory, TransportSession};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval between purges of expired metadata
const METADATA_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Cheaply cloneable handle to a running producer
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    config: ProducerConfig,
    queue: DeliveryQueue,
    dispatcher: DispatcherHandle,
    dispatcher_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    partitioner: Partitioner,
    metadata_cache: MetadataCache,
    session: TransportSession,
    batcher: Batcher,
    retry: RetryPolicy,
    stats: ProducerStats,
    lifecycle: watch::Sender<Lifecycle>,
    /// Partition pipelines and the metadata cleanup task
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Producer {
    /// Create a producer that talks to brokers over TCP.
    ///
    /// No connection is opened here; the first send or metadata lookup
    /// connects to the bootstrap servers.
    pub async fn new(config: ProducerConfig) -> Result<Self> {
        Self::with_connection_factory(config, Arc::new(TcpConnectionFactory::new())).await
    }

    /// Create a producer on top of a custom broker collaborator
    pub async fn with_connection_factory(
        config: ProducerConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let (dispatcher, dispatcher_task) = dispatcher::spawn();
        let (lifecycle, _) = watch::channel(Lifecycle::Running);

        let inner = Arc::new(ProducerInner {
            queue: DeliveryQueue::new(config.queue_capacity, dispatcher.clone()),
            dispatcher,
            dispatcher_task: parking_lot::Mutex::new(Some(dispatcher_task)),
            partitioner: Partitioner::new(),
            metadata_cache: MetadataCache::new(
                config.metadata_max_age(),
                config.retry_backoff_max(),
            ),
            session: TransportSession::new(
                factory,
                config.bootstrap_servers.clone(),
                config.max_in_flight_requests,
                config.request_timeout(),
                config.connection_timeout(),
            ),
            batcher: Batcher::new(
                BatchLimits {
                    max_bytes: config.max_batch_bytes,
                    max_count: config.max_batch_count,
                },
                config.linger(),
            ),
            retry: RetryPolicy::from_config(&config),
            stats: ProducerStats::new(),
            lifecycle,
            tasks: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            config,
        });

        // Spawn metadata cleanup task
        let cleanup_inner = Arc::clone(&inner);
        let mut cleanup_lifecycle = inner.lifecycle.subscribe();
        let cleanup = tokio::spawn(async move {
            let mut interval = tokio::time::interval(METADATA_CLEANUP_INTERVAL);
            loop {
                // The watch guard must not live across the cleanup await
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cleanup_lifecycle.wait_for(|s| *s == Lifecycle::Terminated) => break,
                }
                cleanup_inner.metadata_cache.cleanup().await;
            }
        });
        inner.tasks.lock().push(cleanup);

        info!(
            "Producer initialized with {} bootstrap servers",
            inner.config.bootstrap_servers.len()
        );

        Ok(Self { inner })
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    /// Submit a record; `on_result` fires once with its outcome.
    ///
    /// Returns the record's sequence number within its (topic, key) lane.
    /// Fails with [`Error::QueueFull`] when the destination partition is at
    /// capacity and [`Error::Cancelled`] once [`close`](Self::close) started.
    pub async fn publish<F>(
        &self,
        topic: impl Into<String>,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
        on_result: F,
    ) -> Result<u64>
    where
        F: FnOnce(DeliveryReport) + Send + 'static,
    {
        self.ensure_open()?;
        let record = Record::new(topic, key, value);

        let partitions = self.partition_count(&record.topic).await;
        let assignment = self
            .inner
            .partitioner
            .assign(&record.topic, record.key.as_ref(), partitions);

        // The lane keeps its partition until this record has its outcome
        let callback: DeliveryCallback = match assignment.lease {
            Some(lease) => Box::new(move |report| {
                drop(lease);
                on_result(report);
            }),
            None => Box::new(on_result),
        };
        self.submit(record, assignment.partition, callback)
    }

    /// Submit a record to an explicit partition
    pub async fn publish_to_partition<F>(
        &self,
        topic: impl Into<String>,
        partition: u32,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
        on_result: F,
    ) -> Result<u64>
    where
        F: FnOnce(DeliveryReport) + Send + 'static,
    {
        self.ensure_open()?;
        let record = Record::new(topic, key, value);

        // Without metadata the broker is left to reject an unknown partition
        if let Some(partitions) = self.known_partition_count(&record.topic).await {
            if partition >= partitions {
                return Err(Error::InvalidPartition {
                    topic: record.topic,
                    partition,
                    partitions,
                });
            }
        }
        self.submit(record, partition, Box::new(on_result))
    }

    /// Serialize `item` and submit it.
    ///
    /// Serialization failures are returned here and nothing is enqueued.
    pub async fn publish_serialized<T, S, F>(
        &self,
        topic: impl Into<String>,
        item: &T,
        serializer: &S,
        on_result: F,
    ) -> Result<u64>
    where
        T: ?Sized,
        S: Serializer<T> + ?Sized,
        F: FnOnce(DeliveryReport) + Send + 'static,
    {
        let payload = serializer.serialize(item)?;
        self.publish(topic, payload.key, payload.value, on_result)
            .await
    }

    /// Submit a record and wait for its outcome, bounded by `delivery_timeout`
    pub async fn send(
        &self,
        topic: impl Into<String>,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<RecordMetadata> {
        let (tx, rx) = oneshot::channel();
        self.publish(topic, key, value, move |report| {
            let _ = tx.send(report);
        })
        .await?;

        let report = tokio::time::timeout(self.inner.config.delivery_timeout(), rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Cancelled)?;

        let DeliveryReport {
            topic,
            sequence,
            outcome,
            ..
        } = report;
        match outcome {
            DeliveryOutcome::Delivered { partition, offset } => Ok(RecordMetadata {
                topic,
                partition,
                offset,
                sequence,
            }),
            DeliveryOutcome::Failed(e) => Err(Error::Delivery(e)),
        }
    }

    /// Wait until every submitted record has had its callback invoked.
    ///
    /// # Returns
    ///
    /// - `Ok(())` once nothing is pending
    /// - `Err(Timeout)` if records are still pending after `delivery_timeout`
    pub async fn flush(&self) -> Result<()> {
        let pending = self.inner.dispatcher.pending();
        if pending.count() == 0 {
            return Ok(());
        }

        tokio::time::timeout(self.inner.config.delivery_timeout(), pending.wait_idle())
            .await
            .map_err(|_| {
                warn!("Flush timed out with {} records pending", pending.count());
                Error::Timeout
            })
    }

    /// Get producer statistics
    pub fn stats(&self) -> ProducerStatsSnapshot {
        let stats = &self.inner.stats;
        ProducerStatsSnapshot {
            records_sent: stats.records_sent.load(Ordering::Relaxed),
            records_delivered: stats.records_delivered.load(Ordering::Relaxed),
            records_failed: stats.records_failed.load(Ordering::Relaxed),
            batches_sent: stats.batches_sent.load(Ordering::Relaxed),
            retries: stats.retries.load(Ordering::Relaxed),
            queued: self.inner.queue.queued() as u64,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shut down: stop accepting records, drain for up to `grace_period`,
    /// then cancel whatever is left.
    ///
    /// Sends already in flight finish or time out first. Every record still
    /// pending afterwards gets a [`DeliveryError::Cancelled`] callback.
    /// Calling `close` again has no effect.
    pub async fn close(&self, grace_period: Duration) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Producer already closed");
            return;
        }
        info!("Closing producer (grace period {:?})", grace_period);

        self.inner.queue.close();
        self.inner.lifecycle.send_replace(Lifecycle::Draining);

        let pending = self.inner.dispatcher.pending();
        if tokio::time::timeout(grace_period, pending.wait_idle())
            .await
            .is_err()
        {
            warn!(
                "Grace period elapsed with {} records pending",
                pending.count()
            );
        }

        self.inner.lifecycle.send_replace(Lifecycle::Terminated);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Producer task failed: {}", e);
            }
        }

        let mut cancelled = 0u64;
        for queue in self.inner.queue.partitions() {
            for message in queue.take_all() {
                self.inner.dispatcher.complete(
                    message.record,
                    message.sequence,
                    DeliveryOutcome::Failed(DeliveryError::Cancelled),
                );
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!("Cancelled {} undelivered records", cancelled);
            self.inner
                .stats
                .records_failed
                .fetch_add(cancelled, Ordering::Relaxed);
        }

        self.inner.session.close().await;

        // Every outcome is queued ahead of the shutdown event
        self.inner.dispatcher.shutdown();
        let dispatcher_task = self.inner.dispatcher_task.lock().take();
        if let Some(task) = dispatcher_task {
            if let Err(e) = task.await {
                warn!("Dispatcher task failed: {}", e);
            }
        }

        info!("Producer closed");
    }

    /// Partition count for a topic (from cache or broker).
    ///
    /// Falls back to a single partition when the broker cannot be asked. After
    /// a failed lookup the broker is not asked again for `retry_backoff_max`.
    pub async fn partition_count(&self, topic: &str) -> u32 {
        self.known_partition_count(topic).await.unwrap_or(1)
    }

    /// Force refresh metadata for a topic from the broker
    pub async fn refresh_metadata(&self, topic: &str) -> Result<u32> {
        self.inner.metadata_cache.invalidate(topic).await;
        let partitions = self.inner.session.partition_count(topic).await?;
        self.inner.metadata_cache.put(topic, partitions).await;
        debug!(
            "Refreshed metadata for topic '{}': {} partitions",
            topic, partitions
        );
        Ok(partitions)
    }

    async fn known_partition_count(&self, topic: &str) -> Option<u32> {
        let cache = &self.inner.metadata_cache;
        match cache.lookup(topic).await {
            Lookup::Known(count) => return Some(count),
            Lookup::Unavailable => return None,
            Lookup::Miss => {}
        }

        match self.inner.session.partition_count(topic).await {
            Ok(0) => {
                warn!("Topic '{}' reported no partitions", topic);
                cache.mark_unavailable(topic).await;
                None
            }
            Ok(count) => {
                cache.put(topic, count).await;
                Some(count)
            }
            Err(e) => {
                warn!("Metadata for topic '{}' unavailable: {}", topic, e);
                cache.mark_unavailable(topic).await;
                None
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn submit(&self, record: Record, partition: u32, callback: DeliveryCallback) -> Result<u64> {
        let tp = TopicPartition::new(record.topic.clone(), partition);
        let queue = self
            .inner
            .queue
            .get_or_create(&tp, |queue| self.spawn_pipeline(queue))?;

        let sequence = self.inner.queue.enqueue(&queue, record, callback)?;
        self.inner
            .stats
            .records_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(sequence)
    }

    fn spawn_pipeline(&self, queue: Arc<PartitionQueue>) {
        let inner = Arc::clone(&self.inner);
        let lifecycle = self.inner.lifecycle.subscribe();
        let task = tokio::spawn(partition_pipeline(inner, queue, lifecycle));
        self.inner.tasks.lock().push(task);
    }
}

// ============================================================================
// Partition Pipeline
// ============================================================================

/// Sends batches for one partition, strictly one at a time
async fn partition_pipeline(
    inner: Arc<ProducerInner>,
    queue: Arc<PartitionQueue>,
    mut lifecycle: watch::Receiver<Lifecycle>,
) {
    let tp = queue.topic_partition().clone();
    debug!("Pipeline for {} started", tp);

    while let Some(batch) = inner.batcher.next_batch(&queue, &mut lifecycle).await {
        let result = inner.session.send(&batch).await;
        inner.stats.batches_sent.fetch_add(1, Ordering::Relaxed);

        let error = match result {
            Ok(ack) => {
                inner.complete_batch(batch, &ack);
                continue;
            }
            Err(error) => error,
        };

        let decision = inner.retry.on_failure(batch, &error);
        if decision.requeue.is_empty() {
            warn!("Batch for {} failed: {}", tp, error);
        } else {
            warn!(
                "Batch for {} failed, retrying {} records: {}",
                tp,
                decision.requeue.len(),
                error
            );
        }

        inner
            .stats
            .records_failed
            .fetch_add(decision.failed.len() as u64, Ordering::Relaxed);
        inner
            .stats
            .retries
            .fetch_add(decision.requeue.len() as u64, Ordering::Relaxed);

        for (message, reason) in decision.failed {
            inner.dispatcher.complete(
                message.record,
                message.sequence,
                DeliveryOutcome::Failed(reason),
            );
        }
        queue.requeue_front(decision.requeue);

        if let Some(delay) = decision.delay {
            debug!("Backing off {:?} before resending to {}", delay, tp);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = lifecycle.wait_for(|s| *s == Lifecycle::Terminated) => {}
            }
        }
    }

    debug!("Pipeline for {} stopped", tp);
}

impl ProducerInner {
    fn complete_batch(&self, batch: Batch, ack: &Acknowledgment) {
        let delivered = batch.len() as u64;
        for (position, message) in batch.into_messages().into_iter().enumerate() {
            self.dispatcher.complete(
                message.record,
                message.sequence,
                DeliveryOutcome::Delivered {
                    partition: ack.partition,
                    offset: ack.offset_of(position),
                },
            );
        }
        self.stats
            .records_delivered
            .fetch_add(delivered, Ordering::Relaxed);
    }
}

// ============================================================================
// Statistics
// ============================================================================

struct ProducerStats {
    records_sent: AtomicU64,
    records_delivered: AtomicU64,
    records_failed: AtomicU64,
    batches_sent: AtomicU64,
    retries: AtomicU64,
}

impl ProducerStats {
    fn new() -> Self {
        Self {
            records_sent: AtomicU64::new(0),
            records_delivered: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }
}

/// Producer statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerStatsSnapshot {
    /// Records accepted by `publish`
    pub records_sent: u64,
    /// Records acknowledged by the broker
    pub records_delivered: u64,
    /// Records that ended in a terminal failure (cancellations included)
    pub records_failed: u64,
    /// Batch transmissions attempted
    pub batches_sent: u64,
    /// Record resends scheduled
    pub retries: u64,
    /// Records waiting in partition queues
    pub queued: u64,
}

impl ProducerStatsSnapshot {
    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        if self.records_sent == 0 {
            1.0
        } else {
            self.records_delivered as f64 / self.records_sent as f64
        }
    }

    /// Records without a final outcome yet
    pub fn pending(&self) -> u64 {
        self.records_sent
            .saturating_sub(self.records_delivered + self.records_failed)
    }
}
