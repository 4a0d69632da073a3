//! JSON wire protocol for vector-clock reconciliation.
//!
//! Wire format (one WebSocket text frame per message):
//! ```text
//! {
//!   "version":  "v0alpha",
//!   "kind":     "sync" | "diff",
//!   "topic":    <namespace>,
//!   "identity": <replica id as decimal string>,
//!   "payload":  "<json>"          sync → vector clock, diff → op list
//! }
//! ```
//!
//! The payload travels as a JSON-encoded string. Decoding also accepts it
//! inlined as a plain JSON value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spore_core::{Op, ReplicaId, VClock};
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "v0alpha";

/// Message kinds. Anything unrecognised decodes as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Sender's vector clock
    Sync,
    /// Ops the receiver is missing
    Diff,
    #[serde(other)]
    Unknown,
}

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unexpected message kind: {0:?}")]
    InvalidMessageKind(MessageKind),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub version: String,
    pub kind: MessageKind,
    pub topic: String,
    pub identity: String,
    pub payload: Value,
}

impl WireMessage {
    fn new(kind: MessageKind, topic: &str, identity: ReplicaId, payload: String) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            kind,
            topic: topic.to_string(),
            identity: identity.to_string(),
            payload: Value::String(payload),
        }
    }

    /// Create a sync message carrying `clock`.
    pub fn sync(topic: &str, identity: ReplicaId, clock: &VClock) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_string(clock)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageKind::Sync, topic, identity, payload))
    }

    /// Create a diff message carrying `ops`.
    pub fn diff(topic: &str, identity: ReplicaId, ops: &[Op]) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_string(ops)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageKind::Diff, topic, identity, payload))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Sender's replica id, when the identity field is numeric.
    pub fn sender(&self) -> Option<ReplicaId> {
        self.identity.parse::<u64>().ok().map(ReplicaId)
    }

    /// Parse the clock of a sync message.
    pub fn clock(&self) -> Result<VClock, ProtocolError> {
        if self.kind != MessageKind::Sync {
            return Err(ProtocolError::InvalidMessageKind(self.kind));
        }
        self.parse_payload()
    }

    /// Parse the ops of a diff message.
    pub fn ops(&self) -> Result<Vec<Op>, ProtocolError> {
        if self.kind != MessageKind::Diff {
            return Err(ProtocolError::InvalidMessageKind(self.kind));
        }
        self.parse_payload()
    }

    fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let parsed = match &self.payload {
            Value::String(json) => serde_json::from_str(json),
            inline => serde_json::from_value(inline.clone()),
        };
        parsed.map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spore_core::{Fact, MemoryLog, ReplicatedLog};

    #[test]
    fn test_sync_envelope_shape() {
        let clock: VClock = [(ReplicaId(7), 2)].into_iter().collect();
        let msg = WireMessage::sync("namespace", ReplicaId(7), &clock).unwrap();
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "version": "v0alpha",
                "kind": "sync",
                "topic": "namespace",
                "identity": "7",
                "payload": "{\"7\":2}"
            })
        );
    }

    #[test]
    fn test_diff_roundtrip() {
        let mut log = MemoryLog::new(ReplicaId(1));
        log.append(Fact::new("p1", "kind", "project"));
        log.append(Fact::new("p1", ["project", "name"], "Mycelial"));
        let ops = log.diff(&VClock::new());

        let msg = WireMessage::diff("namespace", ReplicaId(1), &ops).unwrap();
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageKind::Diff);
        assert_eq!(decoded.sender(), Some(ReplicaId(1)));
        assert_eq!(decoded.ops().unwrap(), ops);
    }

    #[test]
    fn test_inline_payload_accepted() {
        let text = r#"{"version":"v0alpha","kind":"sync","topic":"ns","identity":"3","payload":{"3":4}}"#;
        let msg = WireMessage::decode(text).unwrap();
        assert_eq!(msg.clock().unwrap().get(ReplicaId(3)), 4);
    }

    #[test]
    fn test_unknown_kind_decodes() {
        let text = r#"{"version":"v0alpha","kind":"presence","topic":"ns","identity":"3","payload":""}"#;
        let msg = WireMessage::decode(text).unwrap();
        assert_eq!(msg.kind, MessageKind::Unknown);
        assert!(msg.clock().is_err());
        assert!(msg.ops().is_err());
    }

    #[test]
    fn test_wrong_kind_accessor() {
        let msg = WireMessage::sync("ns", ReplicaId(1), &VClock::new()).unwrap();
        assert!(matches!(
            msg.ops(),
            Err(ProtocolError::InvalidMessageKind(MessageKind::Sync))
        ));
    }

    #[test]
    fn test_decode_invalid_text() {
        assert!(WireMessage::decode("garbage").is_err());
    }

    #[test]
    fn test_non_numeric_identity() {
        let mut msg = WireMessage::sync("ns", ReplicaId(1), &VClock::new()).unwrap();
        msg.identity = "relay".to_string();
        assert_eq!(msg.sender(), None);
    }
}
