//! Shared fixtures for producer integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use herald_client::{
    Acknowledgment, Batch, Connection, ConnectionFactory, DeliveryReport, TransportError,
    TransportResult,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Initialize tracing for tests (call once at start of test)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("herald_client=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// One transmission attempt seen by the broker
#[derive(Debug, Clone)]
pub struct SentBatch {
    pub topic: String,
    pub partition: u32,
    pub values: Vec<String>,
    pub retry_counts: Vec<u32>,
}

#[derive(Default)]
struct BrokerState {
    partitions: u32,
    offsets: Mutex<HashMap<(String, u32), u64>>,
    failures: Mutex<VecDeque<TransportError>>,
    sent: Mutex<Vec<SentBatch>>,
    refuse_opens: AtomicU32,
    opens: AtomicU32,
}

/// In-memory broker whose failures are scripted by the test.
///
/// Every send attempt is logged. A queued failure is consumed by the next
/// send; otherwise the batch is appended and offsets advance per partition.
#[derive(Clone)]
pub struct ScriptedBroker {
    state: Arc<BrokerState>,
}

impl ScriptedBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            state: Arc::new(BrokerState {
                partitions,
                ..Default::default()
            }),
        }
    }

    /// Fail the next sends, in order
    pub fn fail_next(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.state.failures.lock().extend(errors);
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_opens(&self, count: u32) {
        self.state.refuse_opens.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentBatch> {
        self.state.sent.lock().clone()
    }

    pub fn opens(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedBroker {
    async fn open(&self, endpoint: &str) -> TransportResult<Arc<dyn Connection>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .state
            .refuse_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::retryable(format!(
                "Connection refused: {}",
                endpoint
            )));
        }
        Ok(Arc::new(ScriptedConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedConnection {
    state: Arc<BrokerState>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send_batch(&self, batch: &Batch) -> TransportResult<Acknowledgment> {
        self.state.sent.lock().push(SentBatch {
            topic: batch.topic().to_string(),
            partition: batch.partition(),
            values: batch
                .records()
                .map(|r| String::from_utf8_lossy(&r.value).to_string())
                .collect(),
            retry_counts: batch.messages().iter().map(|m| m.retry_count()).collect(),
        });

        if let Some(error) = self.state.failures.lock().pop_front() {
            return Err(error);
        }

        let mut offsets = self.state.offsets.lock();
        let next = offsets
            .entry((batch.topic().to_string(), batch.partition()))
            .or_insert(0);
        let base_offset = *next;
        *next += batch.len() as u64;

        Ok(Acknowledgment {
            topic: batch.topic().to_string(),
            partition: batch.partition(),
            base_offset,
        })
    }

    async fn partition_count(&self, _topic: &str) -> TransportResult<u32> {
        Ok(self.state.partitions)
    }

    async fn close(&self) {}
}

/// Collects delivery reports in callback order
#[derive(Clone, Default)]
pub struct ReportLog {
    reports: Arc<Mutex<Vec<DeliveryReport>>>,
}

impl ReportLog {
    pub fn callback(&self) -> impl FnOnce(DeliveryReport) + Send + 'static {
        let reports = Arc::clone(&self.reports);
        move |report| reports.lock().push(report)
    }

    pub fn reports(&self) -> Vec<DeliveryReport> {
        self.reports.lock().clone()
    }

    /// Values delivered for `key`, in callback order
    pub fn values_for(&self, key: &str) -> Vec<String> {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.key.as_deref() == Some(key.as_bytes()))
            .map(|r| String::from_utf8_lossy(&r.value).to_string())
            .collect()
    }
}
