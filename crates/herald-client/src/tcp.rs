//! Pipelined TCP connection speaking the herald wire protocol
//!
//! Requests are written under a per-connection writer lock and tagged with a
//! correlation id; a background reader task matches responses to waiting
//! callers, so any number of partition pipelines can share one socket
//! without waiting on each other's round trips.

use crate::batcher::Batch;
use crate::error::TransportError;
use crate::record::Acknowledgment;
use crate::transport::{Connection, ConnectionFactory, TransportResult};
use async_trait::async_trait;
use herald_protocol::{
    Request, Response, CORRELATION_ID_SIZE, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Map of correlation id to response channel for in-flight requests
type PendingResponses = Arc<Mutex<HashMap<u64, oneshot::Sender<TransportResult<Response>>>>>;

/// Opens [`TcpConnection`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectionFactory;

impl TcpConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn open(&self, endpoint: &str) -> TransportResult<Arc<dyn Connection>> {
        let connection = TcpConnection::connect(endpoint).await?;
        Ok(Arc::new(connection))
    }
}

/// One pipelined broker connection
pub struct TcpConnection {
    endpoint: String,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    pending: PendingResponses,
    next_correlation_id: AtomicU64,
    healthy: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl TcpConnection {
    /// Connect and start the response reader
    pub async fn connect(endpoint: &str) -> TransportResult<Self> {
        let stream = TcpStream::connect(endpoint).await.map_err(|e| {
            TransportError::retryable(format!("Failed to connect to {}: {}", endpoint, e))
        })?;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        let pending: PendingResponses = Arc::new(Mutex::new(HashMap::new()));
        let healthy = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(reader_task(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&healthy),
            endpoint.to_string(),
            shutdown_rx,
        ));

        Ok(Self {
            endpoint: endpoint.to_string(),
            writer: Mutex::new(BufWriter::with_capacity(WRITE_BUFFER_SIZE, write_half)),
            pending,
            next_correlation_id: AtomicU64::new(1),
            healthy,
            shutdown: shutdown_tx,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn closed_error(&self) -> TransportError {
        TransportError::retryable(format!("Connection to {} closed", self.endpoint))
    }

    /// Send one request and wait for its response
    async fn request(&self, request: Request) -> TransportResult<Response> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        // Encoding failures (oversized batches) are not worth resending
        let frame = request
            .encode_frame(correlation_id)
            .map_err(|e| TransportError::fatal(e.to_string()))?;

        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            // Checked under the lock: the reader marks the connection broken
            // before failing everything it holds
            if !self.is_healthy() {
                return Err(self.closed_error());
            }
            pending.insert(correlation_id, response_tx);
        }

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            warn!("Write to {} failed: {}", self.endpoint, e);
            self.healthy.store(false, Ordering::Release);
            self.pending.lock().await.remove(&correlation_id);
            return Err(TransportError::retryable(format!(
                "Write to {} failed: {}",
                self.endpoint, e
            )));
        }
        trace!("Sent request {} to {}", correlation_id, self.endpoint);

        response_rx.await.map_err(|_| self.closed_error())?
    }
}

/// Translate a broker error response
fn broker_error(response: Response, expected: &str) -> TransportError {
    match response {
        Response::Error { code, message } => TransportError {
            message: format!("{}: {}", code, message),
            retryable: code.is_retryable(),
        },
        other => TransportError::fatal(format!(
            "Unexpected response to {} request: {:?}",
            expected, other
        )),
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send_batch(&self, batch: &Batch) -> TransportResult<Acknowledgment> {
        let request = Request::Produce {
            topic: batch.topic().to_string(),
            partition: batch.partition(),
            records: batch.wire_records(),
        };

        match self.request(request).await? {
            Response::Produced {
                topic,
                partition,
                base_offset,
            } => Ok(Acknowledgment {
                topic,
                partition,
                base_offset,
            }),
            other => Err(broker_error(other, "produce")),
        }
    }

    async fn partition_count(&self, topic: &str) -> TransportResult<u32> {
        let request = Request::Metadata {
            topic: topic.to_string(),
        };

        match self.request(request).await? {
            Response::Metadata { partitions, .. } => Ok(partitions),
            other => Err(broker_error(other, "metadata")),
        }
    }

    async fn close(&self) {
        self.healthy.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.endpoint, e);
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

// ============================================================================
// Reader Task
// ============================================================================

/// Reads response frames and hands them to the waiting requests
async fn reader_task(
    read_half: OwnedReadHalf,
    pending: PendingResponses,
    healthy: Arc<AtomicBool>,
    endpoint: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, read_half);
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];

    loop {
        let read_result = tokio::select! {
            result = reader.read_exact(&mut len_buf) => result,
            _ = shutdown.changed() => break,
        };

        if let Err(e) = read_result {
            debug!("Connection to {} closed: {}", endpoint, e);
            break;
        }
        let frame_len = u32::from_be_bytes(len_buf) as usize;

        if !(CORRELATION_ID_SIZE..=MAX_MESSAGE_SIZE).contains(&frame_len) {
            warn!("Invalid frame length {} from {}", frame_len, endpoint);
            break;
        }

        let mut body = vec![0u8; frame_len];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }

        let (correlation_id, response) = match Response::decode_frame(&body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Undecodable response from {}: {}", endpoint, e);
                break;
            }
        };

        let sender = pending.lock().await.remove(&correlation_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => debug!(
                "Received response for unknown correlation id {}",
                correlation_id
            ),
        }
    }

    // Fail everything still waiting; callers treat this as retryable
    healthy.store(false, Ordering::Release);
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(TransportError::retryable(format!(
            "Connection to {} closed",
            endpoint
        ))));
    }
}
