//! Broker collaborator interface and the shared transport session
//!
//! The producer never talks to the network directly. It goes through a
//! [`ConnectionFactory`] that opens [`Connection`]s to bootstrap endpoints;
//! [`TcpConnectionFactory`](crate::TcpConnectionFactory) is the bundled
//! implementation, tests plug in scripted brokers.

use crate::batcher::Batch;
use crate::error::TransportError;
use crate::record::Acknowledgment;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Opens connections to broker endpoints
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn open(&self, endpoint: &str) -> TransportResult<Arc<dyn Connection>>;
}

/// One logical connection to a broker
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Transmit a batch and wait for the broker's acknowledgment
    async fn send_batch(&self, batch: &Batch) -> TransportResult<Acknowledgment>;

    /// Number of partitions of `topic`
    async fn partition_count(&self, topic: &str) -> TransportResult<u32>;

    async fn close(&self);

    /// `false` once the connection is known to be broken
    fn is_healthy(&self) -> bool {
        true
    }
}

/// The producer's single shared connection, opened lazily.
///
/// Opening walks the bootstrap endpoints round-robin, starting after the
/// last endpoint that was tried. A broken connection is discarded so the
/// next call reconnects.
pub(crate) struct TransportSession {
    factory: Arc<dyn ConnectionFactory>,
    endpoints: Vec<String>,
    next_endpoint: AtomicUsize,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    in_flight: Semaphore,
    request_timeout: Duration,
    connection_timeout: Duration,
}

impl TransportSession {
    pub(crate) fn new(
        factory: Arc<dyn ConnectionFactory>,
        endpoints: Vec<String>,
        max_in_flight: usize,
        request_timeout: Duration,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            endpoints,
            next_endpoint: AtomicUsize::new(0),
            connection: Mutex::new(None),
            in_flight: Semaphore::new(max_in_flight),
            request_timeout,
            connection_timeout,
        }
    }

    /// Send a batch, bounded by the request timeout and the in-flight limit
    pub(crate) async fn send(&self, batch: &Batch) -> TransportResult<Acknowledgment> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| TransportError::fatal("Transport session closed"))?;

        let connection = self.connection().await?;
        match tokio::time::timeout(self.request_timeout, connection.send_batch(batch)).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(e)) => {
                if e.is_retryable() && !connection.is_healthy() {
                    self.discard(&connection).await;
                }
                Err(e)
            }
            Err(_) => {
                self.discard(&connection).await;
                Err(TransportError::retryable(format!(
                    "Request for {} timed out after {:?}",
                    batch.topic_partition(),
                    self.request_timeout
                )))
            }
        }
    }

    /// Ask the broker for the partition count of `topic`
    pub(crate) async fn partition_count(&self, topic: &str) -> TransportResult<u32> {
        let connection = self.connection().await?;
        match tokio::time::timeout(self.request_timeout, connection.partition_count(topic)).await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(e)) => {
                if e.is_retryable() && !connection.is_healthy() {
                    self.discard(&connection).await;
                }
                Err(e)
            }
            Err(_) => {
                self.discard(&connection).await;
                Err(TransportError::retryable(format!(
                    "Metadata request for '{}' timed out",
                    topic
                )))
            }
        }
    }

    pub(crate) async fn close(&self) {
        self.in_flight.close();
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await;
        }
    }

    async fn connection(&self) -> TransportResult<Arc<dyn Connection>> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            if connection.is_healthy() {
                return Ok(Arc::clone(connection));
            }
            debug!("Dropping unhealthy connection");
            guard.take();
        }

        let mut last_error = TransportError::retryable("No bootstrap endpoints");
        for _ in 0..self.endpoints.len() {
            let index = self.next_endpoint.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
            let endpoint = &self.endpoints[index];

            match tokio::time::timeout(self.connection_timeout, self.factory.open(endpoint)).await {
                Ok(Ok(connection)) => {
                    info!("Connected to {}", endpoint);
                    // Stay on this endpoint for the next reconnect
                    self.next_endpoint.store(index, Ordering::Relaxed);
                    *guard = Some(Arc::clone(&connection));
                    return Ok(connection);
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to {}: {}", endpoint, e);
                    last_error = e;
                }
                Err(_) => {
                    warn!("Connection timeout to {}", endpoint);
                    last_error =
                        TransportError::retryable(format!("Connection timeout to {}", endpoint));
                }
            }
        }

        // An unreachable broker is transient from the producer's point of view
        Err(TransportError::retryable(format!(
            "No broker reachable: {}",
            last_error
        )))
    }

    async fn discard(&self, connection: &Arc<dyn Connection>) {
        let mut guard = self.connection.lock().await;
        let current = guard
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, connection));
        if current {
            guard.take();
            drop(guard);
            debug!("Discarded broken connection");
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EnqueuedMessage, Record, TopicPartition};
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicBool;

    struct FlakyConnection {
        healthy: AtomicBool,
        hang: bool,
    }

    #[async_trait]
    impl Connection for FlakyConnection {
        async fn send_batch(&self, batch: &Batch) -> TransportResult<Acknowledgment> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if !self.healthy.swap(false, Ordering::SeqCst) {
                return Err(TransportError::retryable("connection reset"));
            }
            Ok(Acknowledgment {
                topic: batch.topic().to_string(),
                partition: batch.partition(),
                base_offset: 0,
            })
        }

        async fn partition_count(&self, _topic: &str) -> TransportResult<u32> {
            Ok(4)
        }

        async fn close(&self) {}

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    /// Refuses every endpoint except `good`, and records every attempt
    struct Factory {
        good: &'static str,
        hang: bool,
        attempts: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl ConnectionFactory for Factory {
        async fn open(&self, endpoint: &str) -> TransportResult<Arc<dyn Connection>> {
            self.attempts.lock().push(endpoint.to_string());
            if endpoint != self.good {
                return Err(TransportError::retryable(format!("refused: {}", endpoint)));
            }
            Ok(Arc::new(FlakyConnection {
                healthy: AtomicBool::new(true),
                hang: self.hang,
            }))
        }
    }

    fn session(factory: Arc<Factory>, timeout: Duration) -> TransportSession {
        TransportSession::new(
            factory,
            vec!["a:1".into(), "b:2".into()],
            2,
            timeout,
            Duration::from_secs(1),
        )
    }

    fn batch() -> Batch {
        let record = Record::new("orders", None, "v");
        Batch::from_messages(
            TopicPartition::new("orders", 0),
            vec![EnqueuedMessage::new(record, 0)],
        )
    }

    #[tokio::test]
    async fn test_failover_and_reconnect() {
        let factory = Arc::new(Factory {
            good: "b:2",
            hang: false,
            attempts: SyncMutex::new(Vec::new()),
        });
        let session = session(Arc::clone(&factory), Duration::from_secs(5));

        assert!(session.send(&batch()).await.is_ok());
        assert_eq!(*factory.attempts.lock(), vec!["a:1", "b:2"]);

        // The connection reports itself broken after one send, so the session
        // reconnects to the endpoint that worked last time
        assert!(session.send(&batch()).await.is_ok());
        assert_eq!(factory.attempts.lock().len(), 3);
        assert_eq!(factory.attempts.lock()[2], "b:2");

        assert_eq!(session.partition_count("orders").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_no_endpoint_reachable_is_retryable() {
        let factory = Arc::new(Factory {
            good: "none",
            hang: false,
            attempts: SyncMutex::new(Vec::new()),
        });
        let err = session(factory, Duration::from_secs(5))
            .send(&batch())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message.contains("No broker reachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_retryable() {
        let factory = Arc::new(Factory {
            good: "a:1",
            hang: true,
            attempts: SyncMutex::new(Vec::new()),
        });
        let session = session(Arc::clone(&factory), Duration::from_millis(200));

        let err = session.send(&batch()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message.contains("timed out"));

        // The timed-out connection was discarded; a new one is opened
        let _ = tokio::time::timeout(Duration::from_millis(500), session.send(&batch())).await;
        assert_eq!(factory.attempts.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_send_after_close_is_fatal() {
        let factory = Arc::new(Factory {
            good: "a:1",
            hang: false,
            attempts: SyncMutex::new(Vec::new()),
        });
        let session = session(factory, Duration::from_secs(5));
        session.close().await;

        let err = session.send(&batch()).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
