//! The wire envelope wrapping one chunk of one logical channel.
//!
//! Envelopes travel as self-describing JSON records with the binary payload
//! base64-encoded; a zero-length payload is the channel-close tombstone.

use serde::{Deserialize, Serialize};

use crate::core::{FabricError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Group of channels torn down together; empty only for ungrouped channels.
    pub channel_group: String,
    pub channel_id: String,
    /// `"host:port"`, or empty when the sender has no address to report.
    pub host_id: String,
    pub sequence_number: u64,
    #[serde(with = "base64_content")]
    pub content: Vec<u8>,
}

impl Envelope {
    pub fn is_close(&self) -> bool {
        self.content.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FabricError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        serde_json::from_slice(bytes).map_err(|e| FabricError::Codec(e.to_string()))
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Envelope(group={}, channel={}, host={}, seq={}, size={})",
            self.channel_group,
            self.channel_id,
            self.host_id,
            self.sequence_number,
            self.content.len()
        )
    }
}

mod base64_content {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let envelope = Envelope {
            channel_group: "group-1".to_string(),
            channel_id: "abc123".to_string(),
            host_id: "localhost:30009".to_string(),
            sequence_number: 7,
            content: b"payload bytes".to_vec(),
        };
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_wire_field_names() {
        let envelope = Envelope {
            channel_group: "g".to_string(),
            channel_id: "c".to_string(),
            host_id: String::new(),
            sequence_number: 0,
            content: vec![0xff, 0x00],
        };
        let json: serde_json::Value =
            serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert!(json.get("channelGroup").is_some());
        assert!(json.get("channelId").is_some());
        assert!(json.get("hostId").is_some());
        assert!(json.get("sequenceNumber").is_some());
        // content is base64 text on the wire
        assert_eq!(json["content"], serde_json::json!("/wA="));
    }

    #[test]
    fn test_empty_content_is_close() {
        let envelope = Envelope {
            channel_group: String::new(),
            channel_id: "c".to_string(),
            host_id: String::new(),
            sequence_number: 3,
            content: Vec::new(),
        };
        assert!(envelope.is_close());
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert!(decoded.is_close());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Envelope::decode(b"not json at all").is_err());
    }
}
