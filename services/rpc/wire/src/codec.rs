//! Payload serialization.
//!
//! The protocol treats payloads as opaque bytes. Channels pick one codec at
//! configuration time and use it for call arguments, results, stream items
//! and fault details.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Value could not be serialized
    #[error("serialization failed: {0}")]
    Encode(String),
    /// Bytes could not be deserialized
    #[error("deserialization failed: {0}")]
    Decode(String),
}

/// Serializer for call payloads
pub trait Codec: Send + Sync {
    /// Codec name for logging
    fn name(&self) -> &'static str;

    /// Serialize a value
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Deserialize a value
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Canonical CBOR payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// JSON payloads, handy for debugging captures
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Codec selected by configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// [`CborCodec`]
    #[default]
    Cbor,
    /// [`JsonCodec`]
    Json,
}

impl Codec for CodecKind {
    fn name(&self) -> &'static str {
        match self {
            CodecKind::Cbor => CborCodec.name(),
            CodecKind::Json => JsonCodec.name(),
        }
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        match self {
            CodecKind::Cbor => CborCodec.serialize(value),
            CodecKind::Json => JsonCodec.serialize(value),
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            CodecKind::Cbor => CborCodec.deserialize(bytes),
            CodecKind::Json => JsonCodec.deserialize(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Quote {
        symbol: String,
        bid: u32,
        tags: Vec<String>,
    }

    fn sample() -> Quote {
        Quote {
            symbol: "ACME".into(),
            bid: 1250,
            tags: vec!["nyse".into()],
        }
    }

    #[test]
    fn test_cbor_and_json_agree_on_values() {
        for kind in [CodecKind::Cbor, CodecKind::Json] {
            let bytes = Codec::serialize(&kind, &sample()).unwrap();
            let back: Quote = kind.deserialize(&bytes).unwrap();
            assert_eq!(back, sample(), "codec {}", kind.name());
        }
    }

    #[test]
    fn test_json_is_textual() {
        let bytes = JsonCodec.serialize(&sample()).unwrap();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("\"ACME\""));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = CborCodec.deserialize::<Quote>(&[0xFF, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
        let err = JsonCodec.deserialize::<Quote>(b"{").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_kind_from_config_string() {
        let kind: CodecKind = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(kind, CodecKind::Json);
        assert_eq!(CodecKind::default(), CodecKind::Cbor);
    }
}
