//! Message codecs: how application-defined types cross the wire.
//!
//! Primitive bodies ([`crate::message::Body`]'s `Str`/`Bytes`/numeric/`Json` variants) never
//! need a codec; they have a fixed wire tag. Anything else has to be registered under a type
//! name before it can be sent to a remote node — delivery within the same process can still use
//! [`crate::message::Body::Local`] without ever touching a codec.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::{BusError, Result};

/// Encodes and decodes a single application type to and from its wire representation.
///
/// `type_name` is the registry key; it is up to the caller to pick one that is stable across
/// the nodes of a cluster (typically `std::any::type_name::<T>()`, though that is not
/// guaranteed stable across compiler versions for callers who need cross-version compatibility
/// and should supply an explicit string instead).
pub trait MessageCodec: Send + Sync {
    /// The registry key this codec is installed under.
    fn type_name(&self) -> &str;

    /// Serialize a value of the codec's type, type-erased as `&dyn Any`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` does not downcast to the codec's expected type, or if
    /// serialization itself fails.
    fn encode(&self, value: &dyn Any) -> Result<Bytes>;

    /// Deserialize a previously encoded payload back into a boxed value of the codec's type.
    ///
    /// `Send + Sync` (rather than just `Send`) so the decoded value can be carried onward as a
    /// [`crate::message::Body::Local`], which wraps `Arc<dyn Any + Send + Sync>`.
    ///
    /// # Errors
    ///
    /// Returns an error if `payload` is not a valid encoding for this codec's type.
    fn decode(&self, payload: Bytes) -> Result<Box<dyn Any + Send + Sync>>;
}

/// A [`MessageCodec`] for any `T` that round-trips through `serde_json`.
///
/// This is the default codec offered to applications that don't want to hand-write one: it
/// costs a JSON encode/decode per hop but needs nothing beyond `Serialize + DeserializeOwned`.
pub struct JsonCodec<T> {
    type_name: String,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> MessageCodec for JsonCodec<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn encode(&self, value: &dyn Any) -> Result<Bytes> {
        let typed = value
            .downcast_ref::<T>()
            .ok_or_else(|| BusError::protocol("codec value type mismatch on encode"))?;
        let bytes = serde_json::to_vec(typed)
            .map_err(|e| BusError::protocol(format!("json encode failed: {e}")))?;
        Ok(Bytes::from(bytes))
    }

    fn decode(&self, payload: Bytes) -> Result<Box<dyn Any + Send + Sync>> {
        let typed: T = serde_json::from_slice(&payload)
            .map_err(|e| BusError::protocol(format!("json decode failed: {e}")))?;
        Ok(Box::new(typed))
    }
}

/// Process-wide table of installed codecs, keyed by type name.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: DashMap<String, Arc<dyn MessageCodec>>,
}

impl CodecRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            codecs: DashMap::new(),
        }
    }

    /// Install `codec`, replacing any previous codec registered under the same type name.
    pub fn register(&self, codec: Arc<dyn MessageCodec>) {
        self.codecs.insert(codec.type_name().to_string(), codec);
    }

    /// Remove the codec installed for `type_name`, if any.
    pub fn unregister(&self, type_name: &str) {
        self.codecs.remove(type_name);
    }

    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<Arc<dyn MessageCodec>> {
        self.codecs.get(type_name).map(|c| c.clone())
    }

    /// Encode `value` (type-erased, with the given `type_name`) using its registered codec.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::CodecMissing`] if no codec is registered for `type_name`.
    pub fn encode(&self, type_name: &str, value: &dyn Any) -> Result<Bytes> {
        let codec = self
            .get(type_name)
            .ok_or_else(|| BusError::CodecMissing {
                type_name: type_name.to_string(),
            })?;
        codec.encode(value)
    }

    /// Decode `payload` (tagged with `type_name`) using its registered codec.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::CodecMissing`] if no codec is registered for `type_name`.
    pub fn decode(&self, type_name: &str, payload: Bytes) -> Result<Box<dyn Any + Send + Sync>> {
        let codec = self
            .get(type_name)
            .ok_or_else(|| BusError::CodecMissing {
                type_name: type_name.to_string(),
            })?;
        codec.decode(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        seq: u32,
    }

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec::<Ping>::new("Ping");
        let value = Ping { seq: 7 };
        let encoded = codec.encode(&value).unwrap();
        let decoded = codec.decode(encoded).unwrap();
        let decoded: Box<Ping> = decoded.downcast().unwrap();
        assert_eq!(*decoded, Ping { seq: 7 });
    }

    #[test]
    fn registry_roundtrip_through_type_name() {
        let registry = CodecRegistry::new();
        registry.register(Arc::new(JsonCodec::<Ping>::new("Ping")));

        let encoded = registry.encode("Ping", &Ping { seq: 1 }).unwrap();
        let decoded = registry.decode("Ping", encoded).unwrap();
        let decoded: Box<Ping> = decoded.downcast().unwrap();
        assert_eq!(*decoded, Ping { seq: 1 });
    }

    #[test]
    fn missing_codec_is_reported() {
        let registry = CodecRegistry::new();
        let err = registry.encode("Nope", &Ping { seq: 0 }).unwrap_err();
        assert!(matches!(err, BusError::CodecMissing { .. }));
    }

    #[test]
    fn unregister_removes_codec() {
        let registry = CodecRegistry::new();
        registry.register(Arc::new(JsonCodec::<Ping>::new("Ping")));
        registry.unregister("Ping");
        assert!(registry.get("Ping").is_none());
    }

    #[test]
    fn encode_rejects_type_mismatch() {
        let codec = JsonCodec::<Ping>::new("Ping");
        let err = codec.encode(&42i32).unwrap_err();
        assert!(matches!(err, BusError::Protocol(_)));
    }
}
