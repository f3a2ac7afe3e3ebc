//! Structured record → (key, payload) conversion

use crate::error::SerializationError;
use bytes::Bytes;
use serde::Serialize;

/// Encoded key and value ready for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// Converts a structured item into a [`Payload`]
pub trait Serializer<T: ?Sized>: Send + Sync {
    fn serialize(&self, item: &T) -> Result<Payload, SerializationError>;
}

/// Passes byte payloads through unchanged, without a key
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSerializer;

impl<T: AsRef<[u8]> + ?Sized> Serializer<T> for RawSerializer {
    fn serialize(&self, item: &T) -> Result<Payload, SerializationError> {
        Ok(Payload {
            key: None,
            value: Bytes::copy_from_slice(item.as_ref()),
        })
    }
}

type KeyFn<T> = Box<dyn Fn(&T) -> Option<Bytes> + Send + Sync>;

/// JSON encoder with an optional key extractor
///
/// ```rust
/// use herald_client::{JsonSerializer, Serializer};
///
/// #[derive(serde::Serialize)]
/// struct Order { user: String, quantity: u32 }
///
/// let serializer = JsonSerializer::new().with_key(|o: &Order| Some(o.user.clone().into()));
/// let payload = serializer
///     .serialize(&Order { user: "user02".into(), quantity: 1 })
///     .unwrap();
/// assert_eq!(payload.key.as_deref(), Some(&b"user02"[..]));
/// ```
pub struct JsonSerializer<T> {
    key_fn: Option<KeyFn<T>>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self { key_fn: None }
    }

    /// Derive the record key from the item
    pub fn with_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&T) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.key_fn = Some(Box::new(key_fn));
        self
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Serializer<T> for JsonSerializer<T> {
    fn serialize(&self, item: &T) -> Result<Payload, SerializationError> {
        let value = serde_json::to_vec(item)?;
        Ok(Payload {
            key: self.key_fn.as_ref().and_then(|f| f(item)),
            value: Bytes::from(value),
        })
    }
}
