//! Credential material and its JSON-safe wire encoding.
//!
//! Credential blobs and key records are trees of JSON-like values whose leaves
//! may be raw bytes (cryptographic keys, signatures, identities). Persistence and
//! transport are JSON, so every binary leaf is tagged on the way out:
//!
//! ```json
//! { "type": "binary", "data": "<base64, standard alphabet, padded>" }
//! ```
//!
//! and reconstructed byte-for-byte on the way in. Decoding also accepts the
//! legacy `{"type": "Buffer", "data": ...}` tag, with `data` either a base64
//! string or an array of byte values.
//!
//! The tag shape is reserved: a [`Material::Map`] whose only keys are `type`
//! (`"binary"` or `"Buffer"`) and `data` is read back as [`Material::Binary`],
//! or rejected when `data` is not valid. Maps with any other key set, or any
//! other `type`, round-trip unchanged.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

pub const BINARY_TAG: &str = "binary";
pub const LEGACY_BINARY_TAG: &str = "Buffer";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 in binary value: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("byte value out of range at index {index}")]
    ByteOutOfRange { index: usize },
    #[error("malformed binary value: {0}")]
    Malformed(&'static str),
}

/// A credential or key value.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Material {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    Binary(Bytes),
    List(Vec<Material>),
    Map(BTreeMap<String, Material>),
}

impl Material {
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self::Binary(bytes.into())
    }

    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Material)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Look up a field of a map value.
    pub fn get(&self, key: &str) -> Option<&Material> {
        match self {
            Self::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for Material {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Material {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Material {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

impl From<bool> for Material {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Material {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

/// Encode a value tree into plain JSON, tagging binary leaves.
pub fn encode(material: &Material) -> Value {
    match material {
        Material::Null => Value::Null,
        Material::Bool(b) => Value::Bool(*b),
        Material::Number(n) => Value::Number(n.clone()),
        Material::Text(s) => Value::String(s.clone()),
        Material::Binary(bytes) => encode_bytes(bytes),
        Material::List(items) => Value::Array(items.iter().map(encode).collect()),
        Material::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), encode(v)))
                .collect::<Map<String, Value>>(),
        ),
    }
}

/// Tag a byte sequence for JSON transport.
pub fn encode_bytes(bytes: &[u8]) -> Value {
    let mut tagged = Map::with_capacity(2);
    tagged.insert("type".into(), Value::String(BINARY_TAG.into()));
    tagged.insert("data".into(), Value::String(STANDARD.encode(bytes)));
    Value::Object(tagged)
}

/// Decode plain JSON back into a value tree, restoring binary leaves.
pub fn decode(value: Value) -> Result<Material, CodecError> {
    Ok(match value {
        Value::Null => Material::Null,
        Value::Bool(b) => Material::Bool(b),
        Value::Number(n) => Material::Number(n),
        Value::String(s) => Material::Text(s),
        Value::Array(items) => Material::List(
            items
                .into_iter()
                .map(decode)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Object(entries) => match binary_tag(&entries) {
            Some(tag) => Material::Binary(decode_tagged(tag, &entries)?),
            None => Material::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| decode(v).map(|m| (k, m)))
                    .collect::<Result<BTreeMap<_, _>, _>>()?,
            ),
        },
    })
}

/// Decode a JSON string produced by [`encode`] + `serde_json::to_string`.
pub fn decode_str(json: &str) -> Result<Material, serde_json::Error> {
    serde_json::from_str(json)
}

fn binary_tag(entries: &Map<String, Value>) -> Option<&str> {
    if entries.len() != 2 || !entries.contains_key("data") {
        return None;
    }
    match entries.get("type").and_then(Value::as_str) {
        Some(tag @ (BINARY_TAG | LEGACY_BINARY_TAG)) => Some(tag),
        _ => None,
    }
}

fn decode_tagged(tag: &str, entries: &Map<String, Value>) -> Result<Bytes, CodecError> {
    match (tag, entries.get("data")) {
        (_, Some(Value::String(b64))) => Ok(Bytes::from(STANDARD.decode(b64)?)),
        (LEGACY_BINARY_TAG, Some(Value::Array(items))) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let byte = item
                    .as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or(CodecError::ByteOutOfRange { index })?;
                out.push(byte);
            }
            Ok(Bytes::from(out))
        }
        _ => Err(CodecError::Malformed("data must be a base64 string")),
    }
}

impl Serialize for Material {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        encode(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Material {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        decode(value).map_err(serde::de::Error::custom)
    }
}
