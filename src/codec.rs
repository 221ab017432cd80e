//! Schema-Versioned Codec
//!
//! Every value crossing the network is wrapped in an [`Envelope`] tagged
//! with a (factory id, type id) pair so the receiver can select the right
//! decoder without out-of-band type information. Payload bytes are bincode.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque, content-addressed resource key used both as the subject of an
/// operation and as routing input
pub type ResourceKey = Bytes;

/// Schema identity of an encoded value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeTag {
    /// Factory (component) identifier
    pub factory_id: i32,
    /// Type identifier within the factory
    pub type_id: i32,
}

impl TypeTag {
    /// Create a new type tag
    pub const fn new(factory_id: i32, type_id: i32) -> Self {
        Self {
            factory_id,
            type_id,
        }
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.factory_id, self.type_id)
    }
}

/// A schema-tagged encoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Schema identity of the payload
    pub tag: TypeTag,
    /// bincode-encoded payload
    pub payload: Bytes,
}

impl Envelope {
    /// Payload size in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Encode a value into a tagged envelope
pub fn encode_tagged<T: Serialize>(tag: TypeTag, value: &T) -> Result<Envelope> {
    let payload = bincode::serialize(value)?;
    Ok(Envelope {
        tag,
        payload: Bytes::from(payload),
    })
}

/// Decode an envelope payload as a concrete type, ignoring the tag.
/// Callers that need tag dispatch go through [`CodecRegistry`].
pub fn decode_payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    Ok(bincode::deserialize(&envelope.payload)?)
}

/// Decoder function registered for one type tag
pub type DecodeFn<T> = fn(&[u8]) -> Result<T>;

/// Registry of decoders keyed by (factory id, type id).
///
/// Decoding an envelope whose tag was never registered fails with
/// [`Error::SchemaUnknown`]; payloads that fail to parse under a known
/// tag fail with [`Error::Codec`].
pub struct CodecRegistry<T> {
    decoders: HashMap<TypeTag, DecodeFn<T>>,
}

impl<T> CodecRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register a decoder for a type tag
    pub fn register(&mut self, tag: TypeTag, decode: DecodeFn<T>) {
        self.decoders.insert(tag, decode);
    }

    /// Check whether a tag is known
    pub fn knows(&self, tag: TypeTag) -> bool {
        self.decoders.contains_key(&tag)
    }

    /// Decode an envelope through the registered decoder for its tag
    pub fn decode(&self, envelope: &Envelope) -> Result<T> {
        match self.decoders.get(&envelope.tag) {
            Some(decode) => decode(&envelope.payload),
            None => Err(Error::SchemaUnknown {
                factory_id: envelope.tag.factory_id,
                type_id: envelope.tag.type_id,
            }),
        }
    }
}

impl<T> Default for CodecRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
