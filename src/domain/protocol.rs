//! Wire protocol for the progress relay.
//!
//! Two message families travel over WebSockets:
//!
//! - media-server -> api-server relay messages, a JSON object tagged by
//!   `type` (`progress` / `complete` / `error`);
//! - browser client frames, `{op, d}` envelopes with integer opcodes.
//!
//! Both are decoded exactly once at the connection boundary into the tagged
//! unions below; unknown types/opcodes are reported to the caller so they
//! can be logged and ignored rather than silently parsed or treated as
//! fatal.

use crate::domain::pid::ProcessId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-resolution sub-progress, `resolution label -> percent`. A `-1`
/// sentinel marks a failed rendition, distinct from 0-100 progress.
pub type DetailedProgress = BTreeMap<String, i32>;

pub const FAILED_RENDITION: i32 = -1;

/// Maximum accepted auth token payload; anything larger is rejected before
/// signature verification is even attempted.
pub const MAX_TOKEN_LEN: usize = 1000;

// ---------------------------------------------------------------------------
// media-server -> api-server
// ---------------------------------------------------------------------------

/// One event forwarded from the processing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    Progress {
        pid: ProcessId,
        #[serde(rename = "userId")]
        user_id: String,
        progress: u8,
        status: String,
        #[serde(rename = "detailedProgress", skip_serializing_if = "Option::is_none")]
        detailed_progress: Option<DetailedProgress>,
        timestamp: DateTime<Utc>,
    },
    Complete {
        pid: ProcessId,
        #[serde(rename = "userId")]
        user_id: String,
        progress: u8,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    Error {
        pid: ProcessId,
        #[serde(rename = "userId")]
        user_id: String,
        status: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

/// Why an inbound relay payload was dropped.
#[derive(Debug)]
pub enum RelayDecodeError {
    /// Valid JSON carrying an unrecognized `type` tag.
    UnknownType(String),
    /// Not valid JSON, or a known type with a malformed body.
    Malformed(String),
}

/// Decode one relay payload. Callers log and ignore errors; a bad message
/// must never take the connection down.
pub fn decode_relay_event(raw: &str) -> Result<RelayEvent, RelayDecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| RelayDecodeError::Malformed(e.to_string()))?;

    match serde_json::from_value::<RelayEvent>(value.clone()) {
        Ok(event) => Ok(event),
        Err(e) => {
            if let Some(kind) = value.get("type").and_then(Value::as_str) {
                if !matches!(kind, "progress" | "complete" | "error") {
                    return Err(RelayDecodeError::UnknownType(kind.to_string()));
                }
            }
            Err(RelayDecodeError::Malformed(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// browser client -> api-server
// ---------------------------------------------------------------------------

pub mod client_op {
    pub const HEARTBEAT_CHECK: u8 = 2;
    pub const AUTHENTICATE: u8 = 4;
    pub const REQUEST_SNAPSHOT: u8 = 6;
}

pub mod server_op {
    pub const AUTH_RESULT: u8 = 1;
    pub const HEARTBEAT_ACK: u8 = 3;
    pub const PROGRESS_EVENT: u8 = 5;
    pub const SNAPSHOT: u8 = 7;
}

/// Outcome of decoding the `d.token` payload of an authenticate frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPayload {
    /// No `d.token` present.
    Missing,
    /// Present but not a string, or longer than [`MAX_TOKEN_LEN`].
    Invalid,
    Token(String),
}

/// A decoded browser frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    HeartbeatCheck,
    Authenticate(AuthPayload),
    RequestSnapshot,
}

#[derive(Debug)]
pub enum ClientDecodeError {
    UnknownOp(u64),
    Malformed(String),
}

#[derive(Deserialize)]
struct ClientEnvelope {
    op: u64,
    #[serde(default)]
    d: Value,
}

/// Decode one browser frame into a [`ClientCommand`].
pub fn decode_client_frame(raw: &str) -> Result<ClientCommand, ClientDecodeError> {
    let envelope: ClientEnvelope =
        serde_json::from_str(raw).map_err(|e| ClientDecodeError::Malformed(e.to_string()))?;

    match envelope.op {
        op if op == client_op::HEARTBEAT_CHECK as u64 => Ok(ClientCommand::HeartbeatCheck),
        op if op == client_op::REQUEST_SNAPSHOT as u64 => Ok(ClientCommand::RequestSnapshot),
        op if op == client_op::AUTHENTICATE as u64 => {
            let payload = match envelope.d.get("token") {
                None => AuthPayload::Missing,
                Some(Value::String(token)) if token.len() <= MAX_TOKEN_LEN => {
                    AuthPayload::Token(token.clone())
                }
                Some(_) => AuthPayload::Invalid,
            };
            Ok(ClientCommand::Authenticate(payload))
        }
        other => Err(ClientDecodeError::UnknownOp(other)),
    }
}

// ---------------------------------------------------------------------------
// api-server -> browser client
// ---------------------------------------------------------------------------

/// The session-store-produced event broadcast to browser clients as the
/// payload of an opcode-5 frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub pid: ProcessId,
    pub user_id: String,
    pub progress: u8,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed_progress: Option<DetailedProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An `{op, d}` frame sent to a browser client.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    pub op: u8,
    pub d: Value,
}

impl ServerFrame {
    pub fn auth_success(active: Value, completed: Value) -> Self {
        Self {
            op: server_op::AUTH_RESULT,
            d: serde_json::json!({
                "authenticated": true,
                "message": "Connected to WebSocket",
                "activeSessions": active,
                "recentCompleted": completed,
            }),
        }
    }

    pub fn auth_failure(message: &str) -> Self {
        Self {
            op: server_op::AUTH_RESULT,
            d: serde_json::json!({ "authenticated": false, "message": message }),
        }
    }

    pub fn heartbeat_ack() -> Self {
        Self {
            op: server_op::HEARTBEAT_ACK,
            d: serde_json::json!({ "message": "ack" }),
        }
    }

    pub fn progress_event(event: &BroadcastEvent) -> Self {
        Self {
            op: server_op::PROGRESS_EVENT,
            d: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }

    pub fn snapshot(active: Value, completed: Value) -> Self {
        Self {
            op: server_op::SNAPSHOT,
            d: serde_json::json!({
                "activeSessions": active,
                "recentCompleted": completed,
            }),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_progress_event() {
        let raw = r#"{
            "type": "progress",
            "pid": "abc",
            "userId": "u1",
            "progress": 40,
            "status": "creating_720p",
            "detailedProgress": {"720p": 50},
            "timestamp": "2024-05-01T10:00:00Z"
        }"#;
        match decode_relay_event(raw).unwrap() {
            RelayEvent::Progress {
                progress,
                status,
                detailed_progress,
                ..
            } => {
                assert_eq!(progress, 40);
                assert_eq!(status, "creating_720p");
                assert_eq!(detailed_progress.unwrap()["720p"], 50);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_relay_type_is_reported_not_fatal() {
        let raw = r#"{"type": "telemetry", "pid": "x"}"#;
        match decode_relay_event(raw) {
            Err(RelayDecodeError::UnknownType(kind)) => assert_eq!(kind, "telemetry"),
            other => panic!("expected unknown type, got {other:?}"),
        }
    }

    #[test]
    fn malformed_relay_payload_is_reported() {
        assert!(matches!(
            decode_relay_event("not json"),
            Err(RelayDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn decodes_client_opcodes() {
        assert_eq!(
            decode_client_frame(r#"{"op": 2}"#).unwrap(),
            ClientCommand::HeartbeatCheck
        );
        assert_eq!(
            decode_client_frame(r#"{"op": 6, "d": {}}"#).unwrap(),
            ClientCommand::RequestSnapshot
        );
        assert_eq!(
            decode_client_frame(r#"{"op": 4, "d": {"token": "t"}}"#).unwrap(),
            ClientCommand::Authenticate(AuthPayload::Token("t".into()))
        );
    }

    #[test]
    fn auth_payload_classification() {
        assert_eq!(
            decode_client_frame(r#"{"op": 4, "d": {}}"#).unwrap(),
            ClientCommand::Authenticate(AuthPayload::Missing)
        );
        assert_eq!(
            decode_client_frame(r#"{"op": 4, "d": {"token": 42}}"#).unwrap(),
            ClientCommand::Authenticate(AuthPayload::Invalid)
        );
        let oversized = "x".repeat(MAX_TOKEN_LEN + 1);
        let raw = format!(r#"{{"op": 4, "d": {{"token": "{oversized}"}}}}"#);
        assert_eq!(
            decode_client_frame(&raw).unwrap(),
            ClientCommand::Authenticate(AuthPayload::Invalid)
        );
    }

    #[test]
    fn unknown_opcode_is_reported() {
        assert!(matches!(
            decode_client_frame(r#"{"op": 99}"#),
            Err(ClientDecodeError::UnknownOp(99))
        ));
    }

    #[test]
    fn server_frames_serialize_with_opcode() {
        let frame = ServerFrame::auth_failure("Not authenticated");
        let json: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["op"], 1);
        assert_eq!(json["d"]["authenticated"], false);
    }
}
