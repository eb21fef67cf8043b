//! Message envelope exchanged over a tether connection.
//!
//! Every typed frame on the wire has the shape
//! `{"id"?: string, "type"?: string, "payload"?: any, "timestamp": number}`.
//! The `type` tag is parsed into a [`MessageKind`] so that dispatch can match
//! on a closed set of protocol kinds while still carrying application tags
//! through [`MessageKind::Other`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::now_millis;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// The `type` tag of an envelope.
///
/// Protocol kinds get their own variant; anything else is kept verbatim in
/// [`MessageKind::Other`]. Serialized as the bare tag string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Heartbeat probe.
    Ping,
    /// Heartbeat reply.
    Pong,
    /// A send that expects an `ack` with the same id.
    Request,
    /// Reply correlated to a `request` by id.
    Ack,
    /// Authentication request payload tag.
    Auth,
    /// Fire-and-forget deauthentication notice.
    Deauth,
    /// Any application-defined tag.
    Other(String),
}

impl MessageKind {
    /// The tag as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Request => "request",
            MessageKind::Ack => "ack",
            MessageKind::Auth => "auth",
            MessageKind::Deauth => "deauth",
            MessageKind::Other(tag) => tag,
        }
    }
}

impl From<&str> for MessageKind {
    fn from(tag: &str) -> Self {
        match tag {
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "request" => MessageKind::Request,
            "ack" => MessageKind::Ack,
            "auth" => MessageKind::Auth,
            "deauth" => MessageKind::Deauth,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        MessageKind::from(tag.as_str())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One unit of data exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id; required for request/ack exchanges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Message tag used for routing.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,

    /// Application data. Omitted on the wire when null.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,

    /// Creation time in epoch milliseconds.
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

impl Envelope {
    /// A typed envelope without an id.
    pub fn new(kind: impl Into<MessageKind>, payload: Value) -> Self {
        Self {
            id: None,
            kind: Some(kind.into()),
            payload,
            timestamp: now_millis(),
        }
    }

    /// Alias of [`Envelope::new`], reads better at call sites building
    /// application messages.
    pub fn typed(kind: impl Into<MessageKind>, payload: Value) -> Self {
        Self::new(kind, payload)
    }

    /// An envelope with no `type` tag.
    pub fn untyped(payload: Value) -> Self {
        Self {
            id: None,
            kind: None,
            payload,
            timestamp: now_millis(),
        }
    }

    /// Heartbeat probe: `{"type":"ping","timestamp":…}`.
    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, Value::Null)
    }

    /// Heartbeat reply: `{"type":"pong","timestamp":…}`.
    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, Value::Null)
    }

    /// A request awaiting an acknowledgment with the same id.
    pub fn request(id: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageKind::Request, payload).with_id(id)
    }

    /// An acknowledgment for the request with the given id.
    pub fn ack(id: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageKind::Ack, payload).with_id(id)
    }

    /// Attach a correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The routing tag, if the envelope is typed.
    pub fn tag(&self) -> Option<&str> {
        self.kind.as_ref().map(MessageKind::as_str)
    }

    /// Whether the envelope carries the given kind.
    pub fn is(&self, kind: &MessageKind) -> bool {
        self.kind.as_ref() == Some(kind)
    }

    /// Serialize for transmission.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Interpret an inbound text frame.
    ///
    /// Never fails:
    /// - a JSON object with a `payload` key keeps that payload;
    /// - a JSON object without one becomes the payload (minus `id`, `type`
    ///   and `timestamp`);
    /// - any other JSON value, or non-JSON text, becomes an untyped envelope
    ///   carrying the raw value.
    pub fn from_wire(text: &str) -> Self {
        let value = match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(_) => return Self::untyped(Value::String(text.to_string())),
        };

        let mut map = match value {
            Value::Object(map) => map,
            other => return Self::untyped(other),
        };

        let id = match map.remove("id") {
            Some(Value::String(id)) => Some(id),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let kind = match map.remove("type") {
            Some(Value::String(tag)) => Some(MessageKind::from(tag)),
            _ => None,
        };
        let timestamp = map
            .remove("timestamp")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(now_millis);
        let payload = match map.remove("payload") {
            Some(payload) => payload,
            None if map.is_empty() => Value::Null,
            None => Value::Object(map),
        };

        Self {
            id,
            kind,
            payload,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ping_serializes_without_payload_or_id() {
        let wire = Envelope::ping().to_wire().unwrap();
        let parsed: Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(parsed["type"], "ping");
        assert!(parsed["timestamp"].is_i64());
        assert!(parsed.get("payload").is_none());
        assert!(parsed.get("id").is_none());
    }

    #[test]
    fn request_carries_id_and_payload() {
        let wire = Envelope::request("42-abc", json!({"q": 1})).to_wire().unwrap();
        let parsed: Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(parsed["id"], "42-abc");
        assert_eq!(parsed["type"], "request");
        assert_eq!(parsed["payload"]["q"], 1);
    }

    #[test]
    fn parse_ack_frame() {
        let env = Envelope::from_wire(
            r#"{"id":"7-x","type":"ack","payload":{"success":true},"timestamp":100}"#,
        );
        assert_eq!(env.id.as_deref(), Some("7-x"));
        assert_eq!(env.kind, Some(MessageKind::Ack));
        assert_eq!(env.payload["success"], true);
        assert_eq!(env.timestamp, 100);
    }

    #[test]
    fn parse_unknown_type_keeps_tag() {
        let env = Envelope::from_wire(r#"{"type":"chat.message","payload":"hi"}"#);
        assert_eq!(env.kind, Some(MessageKind::Other("chat.message".into())));
        assert_eq!(env.tag(), Some("chat.message"));
    }

    #[test]
    fn parse_object_without_payload_uses_remaining_fields() {
        let env = Envelope::from_wire(r#"{"type":"chat","text":"hello","from":"u1"}"#);
        assert_eq!(env.tag(), Some("chat"));
        assert_eq!(env.payload, json!({"text": "hello", "from": "u1"}));
    }

    #[test]
    fn parse_non_json_text_is_untyped() {
        let env = Envelope::from_wire("plain text");
        assert!(env.kind.is_none());
        assert_eq!(env.payload, Value::String("plain text".into()));
    }

    #[test]
    fn parse_json_array_is_untyped() {
        let env = Envelope::from_wire("[1,2,3]");
        assert!(env.kind.is_none());
        assert_eq!(env.payload, json!([1, 2, 3]));
    }

    #[test]
    fn numeric_id_is_stringified() {
        let env = Envelope::from_wire(r#"{"id":12,"type":"ack"}"#);
        assert_eq!(env.id.as_deref(), Some("12"));
        assert!(env.payload.is_null());
    }

    #[test]
    fn kind_tag_round_trip() {
        for tag in ["ping", "pong", "request", "ack", "auth", "deauth", "custom"] {
            let kind = MessageKind::from(tag);
            assert_eq!(String::from(kind), tag);
        }
        assert_eq!(MessageKind::from("ack"), MessageKind::Ack);
        assert_eq!(MessageKind::Other("x".into()).to_string(), "x");
    }
}
