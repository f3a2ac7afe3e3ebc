//! Protocol message types

use crate::error::{ProtocolError, Result};
use crate::types::{ErrorCode, WireRecord};
use crate::{CORRELATION_ID_SIZE, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Requests sent by a producer
///
/// # Stability
///
/// **WARNING**: Variant order must remain stable for postcard serialization compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Append a batch of records to one partition
    Produce {
        topic: String,
        partition: u32,
        records: Vec<WireRecord>,
    },

    /// Ask for the partition count of a topic
    Metadata { topic: String },

    /// Liveness probe
    Ping,
}

/// Broker responses
///
/// **WARNING**: Variant order must remain stable for postcard serialization compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Batch appended; record `i` of the batch landed at `base_offset + i`
    Produced {
        topic: String,
        partition: u32,
        base_offset: u64,
    },

    /// Topic metadata
    Metadata { topic: String, partitions: u32 },

    /// Reply to [`Request::Ping`]
    Pong,

    /// Request failed
    Error { code: ErrorCode, message: String },
}

impl Request {
    /// Serialize to a bare postcard payload
    #[inline]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a bare postcard payload
    #[inline]
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Encode a complete frame, length prefix included
    pub fn encode_frame(&self, correlation_id: u64) -> Result<Vec<u8>> {
        encode_frame(self, correlation_id)
    }

    /// Decode a frame body (everything after the length prefix)
    pub fn decode_frame(body: &[u8]) -> Result<(u64, Self)> {
        decode_frame(body)
    }
}

impl Response {
    /// Serialize to a bare postcard payload
    #[inline]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a bare postcard payload
    #[inline]
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Encode a complete frame, length prefix included
    pub fn encode_frame(&self, correlation_id: u64) -> Result<Vec<u8>> {
        encode_frame(self, correlation_id)
    }

    /// Decode a frame body (everything after the length prefix)
    pub fn decode_frame(body: &[u8]) -> Result<(u64, Self)> {
        decode_frame(body)
    }

    /// Shorthand for an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

fn encode_frame<T: Serialize>(message: &T, correlation_id: u64) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + CORRELATION_ID_SIZE + 128);
    // Length is patched in once the payload size is known.
    frame.extend_from_slice(&[0u8; LENGTH_PREFIX_SIZE]);
    frame.extend_from_slice(&correlation_id.to_be_bytes());
    let mut frame = postcard::to_extend(message, frame)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

    let body_len = frame.len() - LENGTH_PREFIX_SIZE;
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body_len, MAX_MESSAGE_SIZE));
    }
    frame[..LENGTH_PREFIX_SIZE].copy_from_slice(&(body_len as u32).to_be_bytes());
    Ok(frame)
}

fn decode_frame<T: DeserializeOwned>(body: &[u8]) -> Result<(u64, T)> {
    if body.len() < CORRELATION_ID_SIZE {
        return Err(ProtocolError::TruncatedFrame(body.len()));
    }
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body.len(), MAX_MESSAGE_SIZE));
    }

    let mut id = [0u8; CORRELATION_ID_SIZE];
    id.copy_from_slice(&body[..CORRELATION_ID_SIZE]);
    let message = postcard::from_bytes(&body[CORRELATION_ID_SIZE..])
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok((u64::from_be_bytes(id), message))
}
