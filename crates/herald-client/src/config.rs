//! Producer configuration
//!
//! [`ProducerConfig`] is an immutable record handed to the producer at
//! construction. Durations are stored in milliseconds so the record can be
//! loaded from YAML or JSON without custom serde adapters.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Default maximum batch size in bytes
const DEFAULT_MAX_BATCH_BYTES: usize = 16384;
/// Default maximum number of records in one batch
const DEFAULT_MAX_BATCH_COUNT: usize = 500;
/// Default linger time in milliseconds
const DEFAULT_LINGER_MS: u64 = 5;
/// Default per-partition queue capacity (records)
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
/// Default metadata TTL in milliseconds
const DEFAULT_METADATA_MAX_AGE_MS: u64 = 300_000;

/// Producer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Bootstrap endpoints (host:port), tried in order on connect failure
    pub bootstrap_servers: Vec<String>,
    /// Maximum batch size in bytes (key + value of every record)
    pub max_batch_bytes: usize,
    /// Maximum number of records per batch
    pub max_batch_count: usize,
    /// Time to wait for more records before sending a partial batch (ms)
    pub linger_ms: u64,
    /// Maximum queued records per partition before `QueueFull`
    pub queue_capacity: usize,
    /// Number of resends allowed after the first attempt
    pub max_retries: u32,
    /// Initial retry backoff (ms)
    pub retry_backoff_ms: u64,
    /// Maximum retry backoff (ms)
    pub retry_backoff_max_ms: u64,
    /// Random jitter added to each backoff, as a fraction of the delay
    pub retry_jitter: f64,
    /// Per-request timeout (ms)
    pub request_timeout_ms: u64,
    /// Upper bound for `send` and `flush` (ms)
    pub delivery_timeout_ms: u64,
    /// Connection timeout (ms)
    pub connection_timeout_ms: u64,
    /// Maximum concurrent batch sends across all partitions
    pub max_in_flight_requests: usize,
    /// Topic metadata cache TTL (ms)
    pub metadata_max_age_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
            linger_ms: DEFAULT_LINGER_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_retries: 3,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 1000,
            retry_jitter: 0.2,
            request_timeout_ms: 30_000,
            delivery_timeout_ms: 120_000,
            connection_timeout_ms: 10_000,
            max_in_flight_requests: 5,
            metadata_max_age_ms: DEFAULT_METADATA_MAX_AGE_MS,
        }
    }
}

impl ProducerConfig {
    /// Create a new builder
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::default()
    }

    /// High-throughput configuration
    pub fn high_throughput() -> Self {
        Self {
            max_batch_bytes: 65536,
            max_batch_count: 2000,
            linger_ms: 20,
            max_in_flight_requests: 10,
            ..Default::default()
        }
    }

    /// Low-latency configuration
    pub fn low_latency() -> Self {
        Self {
            max_batch_count: 1,
            linger_ms: 0,
            max_in_flight_requests: 1,
            ..Default::default()
        }
    }

    /// Check the configuration for values the producer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(Error::ConfigError(
                "No bootstrap servers configured".to_string(),
            ));
        }
        if self.max_batch_bytes == 0 || self.max_batch_count == 0 {
            return Err(Error::ConfigError(
                "Batch limits must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::ConfigError(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_in_flight_requests == 0 {
            return Err(Error::ConfigError(
                "max_in_flight_requests must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(Error::ConfigError(format!(
                "retry_jitter must be within 0.0..=1.0, got {}",
                self.retry_jitter
            )));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_ms {
            return Err(Error::ConfigError(format!(
                "retry_backoff_max_ms ({}) is lower than retry_backoff_ms ({})",
                self.retry_backoff_max_ms, self.retry_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn metadata_max_age(&self) -> Duration {
        Duration::from_millis(self.metadata_max_age_ms)
    }
}

/// Builder for ProducerConfig
#[derive(Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    /// Set bootstrap servers
    pub fn bootstrap_servers(mut self, servers: Vec<String>) -> Self {
        self.config.bootstrap_servers = servers;
        self
    }

    /// Set maximum batch size in bytes
    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.config.max_batch_bytes = bytes;
        self
    }

    /// Set maximum records per batch
    pub fn max_batch_count(mut self, count: usize) -> Self {
        self.config.max_batch_count = count;
        self
    }

    /// Set linger time in milliseconds
    pub fn linger_ms(mut self, ms: u64) -> Self {
        self.config.linger_ms = ms;
        self
    }

    /// Set per-partition queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set number of retries
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set retry backoff in milliseconds
    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    /// Set maximum retry backoff in milliseconds
    pub fn retry_backoff_max_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_max_ms = ms;
        self
    }

    /// Set backoff jitter fraction (0.0 disables jitter)
    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.config.retry_jitter = jitter;
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set delivery timeout
    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.config.delivery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set max in-flight batch sends
    pub fn max_in_flight_requests(mut self, max: usize) -> Self {
        self.config.max_in_flight_requests = max;
        self
    }

    /// Set metadata max age (TTL)
    pub fn metadata_max_age(mut self, duration: Duration) -> Self {
        self.config.metadata_max_age_ms = duration.as_millis() as u64;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ProducerConfig {
        self.config
    }
}
