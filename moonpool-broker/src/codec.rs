//! Type-tagged payload serialization.
//!
//! Values written to the broker are read back later by processes that have no
//! out-of-band schema, so every payload carries the name of its type:
//!
//! - directory values are wrapped in an [`Envelope`] (`{"$type": .., "payload": ..}`)
//! - stream events carry the tag in a message header and the bare JSON body
//!
//! Decoding resolves the tag through a [`TypeRegistry`]. An unknown tag is a
//! hard [`CodecError::UnknownType`]; there is no fallback type.
//!
//! # Example
//!
//! ```rust
//! use moonpool_broker::codec::{JsonCodec, TypedPayload};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Price {
//!     cents: u64,
//! }
//!
//! impl TypedPayload for Price {
//!     const TYPE_TAG: &'static str = "shop.Price";
//! }
//!
//! let bytes = JsonCodec.encode_tagged(&Price { cents: 250 }).unwrap();
//! let decoded: Price = JsonCodec.decode_tagged(&bytes).unwrap();
//! assert_eq!(decoded, Price { cents: 250 });
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// A payload type with a stable, process-independent name.
///
/// The tag is what goes over the wire; renaming a Rust type must not change
/// it.
pub trait TypedPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name written next to the payload.
    const TYPE_TAG: &'static str;
}

/// Discriminated wrapper for stored values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type tag of `payload`.
    #[serde(rename = "$type")]
    pub type_tag: String,
    /// The serialized value.
    pub payload: serde_json::Value,
}

/// JSON codec using serde_json.
///
/// Human-readable on the broker, which makes bucket and stream contents easy
/// to inspect with the broker's own tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value as bare JSON.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Encode)
    }

    /// Decode bare JSON.
    pub fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(CodecError::Decode)
    }

    /// Encode a value inside an [`Envelope`] carrying its type tag.
    pub fn encode_tagged<T: TypedPayload>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let envelope = Envelope {
            type_tag: T::TYPE_TAG.to_string(),
            payload: serde_json::to_value(value).map_err(CodecError::Encode)?,
        };
        self.encode(&envelope)
    }

    /// Decode an [`Envelope`] and check that it holds a `T`.
    pub fn decode_tagged<T: TypedPayload>(&self, buf: &[u8]) -> Result<T, CodecError> {
        let envelope: Envelope = self.decode(buf)?;
        if envelope.type_tag != T::TYPE_TAG {
            return Err(CodecError::UnknownType(envelope.type_tag));
        }
        serde_json::from_value(envelope.payload).map_err(CodecError::Decode)
    }
}

/// A decoded payload whose concrete type is known only through its tag.
pub type DecodedPayload = Arc<dyn Any + Send + Sync>;

type DecodeFn = fn(&[u8]) -> Result<DecodedPayload, CodecError>;

fn decode_as<T: TypedPayload>(buf: &[u8]) -> Result<DecodedPayload, CodecError> {
    let value: T = JsonCodec.decode(buf)?;
    Ok(Arc::new(value))
}

/// Maps type tags to decoders.
///
/// Receivers only accept payloads whose tag has been registered.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its [`TypedPayload::TYPE_TAG`].
    pub fn register<T: TypedPayload>(&mut self) -> &mut Self {
        self.decoders.insert(T::TYPE_TAG, decode_as::<T>);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: TypedPayload>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Whether a tag is known.
    pub fn contains(&self, type_tag: &str) -> bool {
        self.decoders.contains_key(type_tag)
    }

    /// Decode bytes as the type registered under `type_tag`.
    pub fn decode(&self, type_tag: &str, buf: &[u8]) -> Result<DecodedPayload, CodecError> {
        let decode = self
            .decoders
            .get(type_tag)
            .ok_or_else(|| CodecError::UnknownType(type_tag.to_string()))?;
        decode(buf)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("TypeRegistry").field("tags", &tags).finish()
    }
}
