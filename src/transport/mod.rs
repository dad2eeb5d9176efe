//! Publish/subscribe transport used to reach the Home Assistant broker.
//!
//! The rest of the crate only talks to the [`Transport`] trait. Two
//! implementations are provided:
//! - `mqtt`: rumqttc-backed client for a real broker
//! - `memory`: in-process recorder used by tests and dry runs

pub mod memory;
pub mod mqtt;

use crate::error::Result;
use serde_json::Value;

pub use memory::MemoryTransport;
pub use mqtt::{MqttEventLoop, MqttTransport};

/// Message payload as handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain string payload (states, availability, commands).
    Text(String),
    /// Structured payload, serialized to compact JSON on the wire.
    Json(Value),
    /// Zero-length payload (used to deregister discovery documents).
    Empty,
}

impl Payload {
    /// Serialize the payload to its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Text(text) => text.as_bytes().to_vec(),
            Payload::Json(value) => value.to_string().into_bytes(),
            Payload::Empty => Vec::new(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Message received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

/// Outbound side of the pub/sub channel.
///
/// Both operations only enqueue work and never block; delivery happens on
/// the transport's own event loop.
pub trait Transport: Send + Sync {
    /// Publish a payload on a topic.
    fn publish(&self, topic: &str, payload: &Payload) -> Result<()>;

    /// Ask the broker to deliver messages published on `topic`.
    fn subscribe(&self, topic: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        assert_eq!(Payload::from("on").to_bytes(), b"on".to_vec());
        assert_eq!(
            Payload::from(json!({"a": "1.00"})).to_bytes(),
            br#"{"a":"1.00"}"#.to_vec()
        );
        assert!(Payload::Empty.to_bytes().is_empty());
    }

    #[test]
    fn test_accessors() {
        let text = Payload::from("offline".to_string());
        assert_eq!(text.as_text(), Some("offline"));
        assert!(text.as_json().is_none());
        assert!(!text.is_empty());
        assert!(Payload::Empty.is_empty());
    }
}
