//! The message flowing through mediation sequences and proxy services.
//!
//! Transports build a [`Message`] from their wire representation and hand it
//! to the engine; the core never interprets the payload bytes itself. Control
//! data travels in named properties (see [`properties`]).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Well-known property names read or written by the mediation core.
pub mod properties {
    /// Boolean. When `true`, the remaining mediators of the current pipeline are skipped.
    pub const STOP_FLOW: &str = "STOP_FLOW";
    /// Display form of the error that triggered error/fault recovery.
    pub const ERROR_MESSAGE: &str = "ERROR_MESSAGE";
    /// Full error chain of the error that triggered error/fault recovery.
    pub const ERROR_DETAIL: &str = "ERROR_DETAIL";
    /// Name of the sequence or proxy service in which the error occurred.
    pub const ERROR_SEQUENCE: &str = "ERROR_SEQUENCE";
    /// Client identity used as the throttling key.
    pub const CLIENT_ID: &str = "CLIENT_ID";
    /// Message id assigned when a proxy hands the message to reliable delivery.
    pub const RELIABLE_MESSAGE_ID: &str = "RELIABLE_MESSAGE_ID";
    /// Boolean. Set on responses served from a proxy response cache.
    pub const CACHE_HIT: &str = "CACHE_HIT";
}

/// Message flow direction relative to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Direction {
    /// Request travelling from a client towards a backend.
    #[default]
    Inbound,
    /// Response travelling back towards the client.
    Outbound,
}

/// A single message: opaque payload, transport headers, and named properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (UUID v4 unless supplied by the transport).
    pub id: String,
    /// Raw payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Transport headers.
    pub headers: HashMap<String, String>,
    /// Named properties used for control flow between mediators.
    pub properties: HashMap<String, Value>,
    /// Flow direction.
    pub direction: Direction,
}

impl Message {
    /// Creates an inbound message with a fresh id.
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    /// Creates an inbound message with a caller-supplied id.
    #[must_use]
    pub fn with_id(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            properties: HashMap::new(),
            direction: Direction::Inbound,
        }
    }

    /// Builder-style header setter.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builder-style property setter.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Returns a property value, if set.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Sets a property, returning the previous value.
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Option<Value> {
        self.properties.insert(name.into(), value.into())
    }

    /// Removes a property, returning its value.
    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    /// Returns a header value, if set.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Payload interpreted as UTF-8, lossily.
    #[must_use]
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Whether `STOP_FLOW` is set to `true`.
    #[must_use]
    pub fn is_flow_stopped(&self) -> bool {
        self.property(properties::STOP_FLOW)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Sets `STOP_FLOW`, short-circuiting the rest of the current pipeline.
    pub fn stop_flow(&mut self) {
        self.set_property(properties::STOP_FLOW, true);
    }

    /// Builds an outbound response carrying `payload`, inheriting headers and properties.
    #[must_use]
    pub fn reply(&self, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload: payload.into(),
            headers: self.headers.clone(),
            properties: self.properties.clone(),
            direction: Direction::Outbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_is_inbound_with_unique_id() {
        let a = Message::new("a");
        let b = Message::new("b");
        assert_eq!(a.direction, Direction::Inbound);
        assert_ne!(a.id, b.id);
        assert_eq!(a.payload_text(), "a");
    }

    #[test]
    fn stop_flow_flag() {
        let mut msg = Message::new("x");
        assert!(!msg.is_flow_stopped());
        msg.stop_flow();
        assert!(msg.is_flow_stopped());

        // A non-boolean STOP_FLOW is not treated as set.
        msg.set_property(properties::STOP_FLOW, "yes");
        assert!(!msg.is_flow_stopped());
    }

    #[test]
    fn reply_inherits_context_and_flips_direction() {
        let req = Message::new("req")
            .header("Content-Type", "text/plain")
            .with_property(properties::CLIENT_ID, "acme");
        let resp = req.reply("resp");
        assert_eq!(resp.direction, Direction::Outbound);
        assert_eq!(resp.header_value("Content-Type"), Some("text/plain"));
        assert_eq!(
            resp.property(properties::CLIENT_ID),
            Some(&Value::from("acme"))
        );
        assert_ne!(resp.id, req.id);
    }

    #[test]
    fn msgpack_roundtrip_keeps_payload_bytes() {
        let msg = Message::with_id("m-1", vec![0_u8, 159, 146, 150])
            .with_property("n", 3_i64);
        let bytes = rmp_serde::to_vec_named(&msg).expect("serialize");
        let decoded: Message = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(decoded, msg);
    }
}
