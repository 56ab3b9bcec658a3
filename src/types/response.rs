use serde::Deserialize;
use serde_json::{Map, Value};

use crate::Result;
use crate::serde_helpers::deserialize_with_warnings;
use crate::ws::WsError;

/// Inbound envelope.
///
/// Recognized `type`s are validated into their payload shape at the parse
/// boundary. Any other `type` becomes [`ServerMessage::Unknown`] and is only
/// ever delivered to global handlers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Progress for a task, delivered to that task's subscribers
    TaskUpdate(TaskUpdate),
    /// Reply to one of our pings
    Pong(Beat),
    /// Unsolicited server liveness signal
    Heartbeat(Beat),
    /// Backend acknowledgment of a new connection
    ConnectionEstablished(ConnectionEstablished),
    /// Backend complaint about a frame we sent
    Error(ErrorMessage),
    /// Any envelope with an unrecognized `type`
    Unknown(UnknownMessage),
}

/// `task_update` payload.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskUpdate {
    pub task_id: Option<String>,
    /// Update body handed to subscribers; `null` when absent
    #[serde(default)]
    pub data: Value,
    pub timestamp: Option<Value>,
    /// Additional per-type fields, preserved for global handlers
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskUpdate {
    /// The task this update should be routed to. Empty ids are not routable.
    #[must_use]
    pub fn routable_task_id(&self) -> Option<&str> {
        self.task_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// `pong` / `heartbeat` payload. The backend echoes a ping's numeric
/// timestamp in `pong` but sends a string in `heartbeat`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Beat {
    pub timestamp: Option<Value>,
}

/// `connection_established` payload.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectionEstablished {
    /// Client identifier as seen by the backend
    pub client_id: Option<String>,
    pub message: Option<String>,
}

/// `error` payload.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub message: String,
}

/// Envelope with a `type` this client does not model.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownMessage {
    pub kind: String,
    /// Every field except `type`
    pub fields: Map<String, Value>,
}

impl ServerMessage {
    /// Validate a single decoded JSON envelope.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(WsError::InvalidMessage(format!(
                    "envelope is not a JSON object: {other}"
                ))
                .into());
            }
        };
        let Some(Value::String(kind)) = fields.remove("type") else {
            return Err(
                WsError::InvalidMessage("envelope has no string `type` field".to_owned()).into(),
            );
        };

        let message = match kind.as_str() {
            "task_update" => Self::TaskUpdate(deserialize_with_warnings(Value::Object(fields))?),
            "pong" => Self::Pong(deserialize_with_warnings(Value::Object(fields))?),
            "heartbeat" => Self::Heartbeat(deserialize_with_warnings(Value::Object(fields))?),
            "connection_established" => {
                Self::ConnectionEstablished(deserialize_with_warnings(Value::Object(fields))?)
            }
            "error" => Self::Error(deserialize_with_warnings(Value::Object(fields))?),
            _ => Self::Unknown(UnknownMessage { kind, fields }),
        };

        Ok(message)
    }

    /// The wire `type` of this message.
    #[must_use]
    pub fn message_type(&self) -> &str {
        match self {
            Self::TaskUpdate(_) => "task_update",
            Self::Pong(_) => "pong",
            Self::Heartbeat(_) => "heartbeat",
            Self::ConnectionEstablished(_) => "connection_established",
            Self::Error(_) => "error",
            Self::Unknown(unknown) => &unknown.kind,
        }
    }

    /// Whether this frame proves the server is alive.
    #[must_use]
    pub const fn is_liveness(&self) -> bool {
        matches!(self, Self::Pong(_) | Self::Heartbeat(_))
    }
}

/// Parse one text frame into envelopes.
///
/// A frame holding a JSON array yields one message per element; empty or
/// whitespace-only frames yield nothing. A single malformed element fails the
/// whole frame.
pub fn parse_frame(text: &str) -> Result<Vec<ServerMessage>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<Value>(trimmed).map_err(WsError::MessageParse)? {
        Value::Array(items) => items.into_iter().map(ServerMessage::from_value).collect(),
        value => Ok(vec![ServerMessage::from_value(value)?]),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_task_update() {
        let messages = parse_frame(
            r#"{"type":"task_update","task_id":"t-1","data":{"status":"completed"}}"#,
        )
        .unwrap();

        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::TaskUpdate(update) => {
                assert_eq!(update.routable_task_id(), Some("t-1"));
                assert_eq!(update.data, json!({ "status": "completed" }));
                assert!(update.extra.is_empty());
            }
            other => panic!("Expected TaskUpdate, got {other:?}"),
        }
    }

    #[test]
    fn task_update_without_data_is_null() {
        let messages = parse_frame(r#"{"type":"task_update","task_id":"t-1"}"#).unwrap();
        let ServerMessage::TaskUpdate(update) = &messages[0] else {
            panic!("Expected TaskUpdate");
        };
        assert_eq!(update.data, Value::Null);
    }

    #[test]
    fn task_update_with_empty_task_id_is_not_routable() {
        let messages = parse_frame(r#"{"type":"task_update","task_id":"","data":1}"#).unwrap();
        let ServerMessage::TaskUpdate(update) = &messages[0] else {
            panic!("Expected TaskUpdate");
        };
        assert_eq!(update.routable_task_id(), None);
    }

    #[test]
    fn task_update_keeps_additional_fields() {
        let messages =
            parse_frame(r#"{"type":"task_update","task_id":"t","data":{},"step":3}"#).unwrap();
        let ServerMessage::TaskUpdate(update) = &messages[0] else {
            panic!("Expected TaskUpdate");
        };
        assert_eq!(update.extra.get("step"), Some(&json!(3)));
    }

    #[test]
    fn parse_liveness_frames() {
        let pong = parse_frame(r#"{"type":"pong","timestamp":1700000000000}"#).unwrap();
        let heartbeat = parse_frame(r#"{"type":"heartbeat","timestamp":"1234.5"}"#).unwrap();

        assert!(matches!(&pong[0], ServerMessage::Pong(beat) if beat.timestamp == Some(json!(1_700_000_000_000_i64))));
        assert!(matches!(&heartbeat[0], ServerMessage::Heartbeat(beat) if beat.timestamp == Some(json!("1234.5"))));
        assert!(pong[0].is_liveness());
        assert!(heartbeat[0].is_liveness());
    }

    #[test]
    fn parse_connection_established() {
        let messages = parse_frame(
            r#"{"type":"connection_established","client_id":"abc","message":"WebSocket connection established"}"#,
        )
        .unwrap();

        assert_eq!(
            messages[0],
            ServerMessage::ConnectionEstablished(ConnectionEstablished {
                client_id: Some("abc".to_owned()),
                message: Some("WebSocket connection established".to_owned()),
            })
        );
        assert!(!messages[0].is_liveness());
    }

    #[test]
    fn parse_error_frame() {
        let messages =
            parse_frame(r#"{"type":"error","message":"Unknown message type: action_request"}"#)
                .unwrap();
        assert!(
            matches!(&messages[0], ServerMessage::Error(e) if e.message.contains("action_request"))
        );
    }

    #[test]
    fn unknown_type_is_preserved() {
        let messages = parse_frame(r#"{"type":"screenshot","url":"/s/1.png"}"#).unwrap();
        match &messages[0] {
            ServerMessage::Unknown(unknown) => {
                assert_eq!(unknown.kind, "screenshot");
                assert_eq!(unknown.fields.get("url"), Some(&json!("/s/1.png")));
                assert!(!unknown.fields.contains_key("type"));
            }
            other => panic!("Expected Unknown, got {other:?}"),
        }
        assert_eq!(messages[0].message_type(), "screenshot");
    }

    #[test]
    fn parse_array_frame() {
        let messages = parse_frame(
            r#"[{"type":"heartbeat"},{"type":"task_update","task_id":"a","data":null}]"#,
        )
        .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type(), "heartbeat");
        assert_eq!(messages[1].message_type(), "task_update");
    }

    #[test]
    fn blank_frame_yields_nothing() {
        assert!(parse_frame("  \n").unwrap().is_empty());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(parse_frame("{not json").is_err());
        assert!(parse_frame(r#"{"task_id":"t-1"}"#).is_err());
        assert!(parse_frame(r#"{"type":7}"#).is_err());
        assert!(parse_frame("42").is_err());
        assert!(parse_frame(r#"{"type":"task_update","task_id":5}"#).is_err());
    }
}
