//! Payload carried between the sequenced producer and the consumer.
//!
//! A chunk names its source and its position within that source, so the
//! business row derived from it has a key independent of the log offset it
//! happened to be delivered at.

use crate::error::{IngestError, IngestResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// One published unit of source data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// Source identity (for a file: its name)
    pub source: String,
    /// Position within the source; equal to the message's sequence number
    pub position: i64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ChunkEnvelope {
    pub fn new(source: impl Into<String>, position: i64, data: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            position,
            data,
        }
    }

    pub fn encode(&self) -> IngestResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a payload; malformed input is a non-retriable error.
    pub fn decode(payload: &[u8]) -> IngestResult<Self> {
        let envelope: Self = serde_json::from_slice(payload)
            .map_err(|e| IngestError::InvalidPayload(format!("chunk envelope: {}", e)))?;

        if envelope.source.is_empty() {
            return Err(IngestError::InvalidPayload(
                "chunk envelope: empty source".into(),
            ));
        }

        Ok(envelope)
    }
}

mod base64_bytes {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let envelope = ChunkEnvelope::new("input.txt", 3, b"hello".to_vec());
        let json: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

        assert_eq!(json["source"], "input.txt");
        assert_eq!(json["position"], 3);
        assert_eq!(json["data"], "aGVsbG8=");
        assert_eq!(ChunkEnvelope::decode(&envelope.encode().unwrap()).unwrap(), envelope);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ChunkEnvelope::decode(b"not json"),
            Err(IngestError::InvalidPayload(_))
        ));
        assert!(matches!(
            ChunkEnvelope::decode(br#"{"source":"a","position":1,"data":"@@@"}"#),
            Err(IngestError::InvalidPayload(_))
        ));
        assert!(matches!(
            ChunkEnvelope::decode(br#"{"source":"","position":1,"data":""}"#),
            Err(IngestError::InvalidPayload(_))
        ));
    }
}
