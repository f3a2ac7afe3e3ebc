//! Herald Wire Protocol
//!
//! Request/response messages exchanged between a herald producer and a broker,
//! plus the length-prefixed frame format used on the wire.
//!
//! # Frame layout
//!
//! ```text
//! [length: u32 BE][correlation_id: u64 BE][postcard payload]
//! ```
//!
//! `length` counts the correlation id and the payload, not itself. Responses
//! carry the correlation id of the request they answer, so a connection can
//! pipeline requests and match responses out of order.
//!
//! # Protocol Stability
//!
//! Enum variant order is significant for postcard serialization. Reordering
//! variants breaks wire compatibility with existing brokers.
//!
//! # Example
//!
//! ```rust
//! use herald_protocol::{Request, Response};
//!
//! let frame = Request::Ping.encode_frame(7).unwrap();
//! let (id, request) = Request::decode_frame(&frame[4..]).unwrap();
//! assert_eq!(id, 7);
//! assert!(matches!(request, Request::Ping));
//! # let _ = Response::Pong;
//! ```

mod error;
mod messages;
mod types;

pub use error::{ProtocolError, Result};
pub use messages::{Request, Response};
pub use types::{ErrorCode, WireRecord};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame body size (64 MiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the correlation id that starts every frame body
pub const CORRELATION_ID_SIZE: usize = 8;
