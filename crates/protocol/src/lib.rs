//! Metamorphosis - Protocol
//!
//! The message type carried from the MQTT side to the Kafka side, and the
//! envelope codec that turns it into a self-contained Kafka record payload.
//!
//! # Wire format
//!
//! Each record is a JSON object with exactly two fields:
//!
//! ```text
//! {"Topic":"sensors/temp","Content":"SnVzdCBhIHRlc3Q="}
//! ```
//!
//! `Content` is base64-encoded so arbitrary binary payloads round-trip
//! byte-for-byte. Consumers filter liveness probe records by `Topic`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single message received from the MQTT broker, awaiting delivery.
///
/// Created on ingress and never mutated; dropped once the batch containing
/// it has been acknowledged by the Kafka writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// MQTT topic the message arrived on
    pub topic: String,

    /// Raw message payload
    pub content: Vec<u8>,
}

impl Message {
    /// Create a new message
    pub fn new(topic: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            content: content.into(),
        }
    }

    /// Encode this message into a record payload
    ///
    /// The encoding is deterministic: field order is fixed and the content
    /// escape is plain base64.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let envelope = EnvelopeRef {
            topic: &self.topic,
            content: &self.content,
        };
        serde_json::to_vec(&envelope).map_err(CodecError::Encode)
    }

    /// Decode a record payload back into a message
    ///
    /// Only exercised by test collaborators; the bridge itself never reads
    /// records back.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let envelope: Envelope = serde_json::from_slice(payload).map_err(CodecError::Decode)?;
        Ok(Self {
            topic: envelope.topic,
            content: envelope.content,
        })
    }
}

/// Errors from the envelope codec
#[derive(Debug, Error)]
pub enum CodecError {
    /// Message could not be serialized
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    /// Payload is not a valid record
    #[error("failed to decode record: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Borrowing view used for encoding
#[derive(Serialize)]
struct EnvelopeRef<'a> {
    #[serde(rename = "Topic")]
    topic: &'a str,

    #[serde(rename = "Content", serialize_with = "as_base64")]
    content: &'a [u8],
}

/// Owned form used for decoding
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Topic")]
    topic: String,

    #[serde(rename = "Content", deserialize_with = "from_base64")]
    content: Vec<u8>,
}

fn as_base64<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn from_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    BASE64
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}
