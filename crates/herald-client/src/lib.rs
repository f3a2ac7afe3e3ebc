//! # herald-client
//!
//! Asynchronous, ordered, at-least-once message publisher.
//!
//! Records submitted to a [`Producer`] are buffered per destination
//! partition, sent in size- and linger-bounded batches, and retried with
//! exponential backoff on transient broker failures. Each record's delivery
//! callback fires exactly once, and callbacks for the same (topic, key) fire
//! in submission order even when batches are retried or complete out of
//! order.
//!
//! The broker is reached through the [`ConnectionFactory`] / [`Connection`]
//! traits; [`TcpConnectionFactory`] speaks the `herald-protocol` wire format.
//!
//! # Example
//!
//! ```rust,ignore
//! use herald_client::{JsonSerializer, Producer, ProducerConfig};
//! use std::time::Duration;
//!
//! #[derive(serde::Serialize)]
//! struct Order { user: String, item: String, quantity: u32 }
//!
//! # async fn example() -> herald_client::Result<()> {
//! let producer = Producer::new(ProducerConfig::default()).await?;
//! let serializer = JsonSerializer::new().with_key(|o: &Order| Some(o.user.clone().into()));
//!
//! let order = Order { user: "user02".into(), item: "chicken bowl".into(), quantity: 1 };
//! producer
//!     .publish_serialized("orders", &order, &serializer, |report| {
//!         if let Some(err) = report.error() {
//!             eprintln!("Delivery failed: {}", err);
//!         }
//!     })
//!     .await?;
//!
//! producer.flush().await?;
//! producer.close(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod config;
mod dispatcher;
pub mod error;
pub mod hash;
mod metadata;
mod partitioner;
pub mod producer;
mod queue;
pub mod record;
mod retry;
pub mod serializer;
pub mod tcp;
pub mod transport;

pub use batcher::{Batch, BatchLimits};
pub use config::{ProducerConfig, ProducerConfigBuilder};
pub use error::{DeliveryError, Error, Result, SerializationError, TransportError};
pub use producer::{Producer, ProducerStatsSnapshot};
pub use record::{
    Acknowledgment, DeliveryCallback, DeliveryOutcome, DeliveryReport, EnqueuedMessage, Record,
    RecordMetadata, TopicPartition,
};
pub use serializer::{JsonSerializer, Payload, RawSerializer, Serializer};
pub use tcp::{TcpConnection, TcpConnectionFactory};
pub use transport::{Connection, ConnectionFactory, TransportResult};

// Re-export protocol types used in the public API
pub use herald_protocol::{ErrorCode, WireRecord};
