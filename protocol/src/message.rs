//! Framed records exchanged on the client channel.
//!
//! Inbound messages are `{type, payload}` envelopes; outbound events wrap
//! the execution events of [`crate::events`] in a
//! `{event_type, data, timestamp}` envelope so transports can forward them
//! without inspecting variant-specific fields.

use serde::Deserialize;
use serde::Serialize;

use crate::events::Event;
use crate::events::unix_timestamp;

/// Raw inbound frame. Anything that does not carry both fields is
/// rejected upstream with [`ErrorCode::InvalidMessage`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub assistant_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HitlDecisionPayload {
    #[serde(default)]
    pub decisions: Vec<Decision>,
}

/// A human's answer to an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Decision {
    #[serde(rename = "type")]
    pub kind: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            kind: DecisionKind::Approve,
            message: None,
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Reject,
            message: Some(message.into()),
        }
    }

    pub fn is_reject(&self) -> bool {
        self.kind == DecisionKind::Reject
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Reject,
    /// Approve, and tell the requesting surface it may answer the rest
    /// of the round on the user's behalf. The core records it like an
    /// approval; suppressing later prompts is the surface's choice.
    AutoApproveAll,
}

/// Protocol error codes carried by outbound `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    EmptyMessage,
    UnknownMessageType,
    EmptyDecision,
    NoPendingDecision,
    ExecutorError,
    ExecutionError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::EmptyMessage => "EMPTY_MESSAGE",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            ErrorCode::EmptyDecision => "EMPTY_DECISION",
            ErrorCode::NoPendingDecision => "NO_PENDING_DECISION",
            ErrorCode::ExecutorError => "EXECUTOR_ERROR",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Outbound envelope: `{event_type, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerEvent {
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: f64,
}

impl ServerEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: unix_timestamp(),
        }
    }

    /// First event of every accepted connection.
    pub fn connected(session_id: &str) -> Self {
        Self::new("connected", serde_json::json!({ "session_id": session_id }))
    }

    pub fn pong() -> Self {
        Self::new("pong", serde_json::json!({}))
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self::new(
            "error",
            serde_json::json!({
                "error_code": code.as_str(),
                "message": message.into(),
                "recoverable": recoverable,
            }),
        )
    }
}

impl From<&Event> for ServerEvent {
    /// Re-wrap a flat execution event: the discriminant moves to the
    /// envelope, the variant fields become `data`.
    fn from(event: &Event) -> Self {
        let mut value = event.encode();
        let (event_type, timestamp) = match &value {
            serde_json::Value::Object(map) => (
                map.get("event_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                map.get("timestamp").and_then(|v| v.as_f64()).unwrap_or(0.0),
            ),
            _ => ("unknown".to_string(), 0.0),
        };
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("event_type");
            map.remove("timestamp");
        }
        Self {
            event_type,
            data: value,
            timestamp,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::events::DoneEvent;
    use crate::events::EventMsg;
    use crate::events::TextEvent;

    #[test]
    fn envelope_requires_type_and_payload() {
        let ok: Result<ClientEnvelope, _> =
            serde_json::from_str(r#"{"type":"ping","payload":{}}"#);
        assert!(ok.is_ok());

        let missing_payload: Result<ClientEnvelope, _> =
            serde_json::from_str(r#"{"type":"ping"}"#);
        assert!(missing_payload.is_err());
    }

    #[test]
    fn decision_wire_format() {
        let decision: Decision = serde_json::from_str(r#"{"type":"approve"}"#).unwrap();
        assert_eq!(decision, Decision::approve());

        let reject = Decision::reject("Approval timeout");
        let encoded = serde_json::to_value(&reject).unwrap();
        assert_eq!(encoded["type"], "reject");
        assert_eq!(encoded["message"], "Approval timeout");
    }

    #[test]
    fn server_event_wraps_execution_event() {
        let event = Event::new(EventMsg::Text(TextEvent {
            content: "hi".to_string(),
            is_final: false,
        }));
        let wrapped = ServerEvent::from(&event);
        assert_eq!(wrapped.event_type, "text");
        assert_eq!(wrapped.data["content"], "hi");
        assert_eq!(wrapped.data["is_final"], false);
        assert!(wrapped.data.get("event_type").is_none());
        assert_eq!(wrapped.timestamp, event.timestamp);
    }

    #[test]
    fn connected_and_pong_envelopes() {
        let connected = ServerEvent::connected("sess-1");
        assert_eq!(connected.event_type, "connected");
        assert_eq!(connected.data["session_id"], "sess-1");

        let pong = ServerEvent::pong();
        assert_eq!(pong.event_type, "pong");
    }

    #[test]
    fn error_envelope_carries_code() {
        let err = ServerEvent::error(ErrorCode::EmptyMessage, "Message cannot be empty", true);
        assert_eq!(err.data["error_code"], "EMPTY_MESSAGE");
        assert_eq!(err.data["recoverable"], true);
    }

    #[test]
    fn done_event_envelope() {
        let event = Event::new(EventMsg::Done(DoneEvent::cancelled()));
        let wrapped = ServerEvent::from(&event);
        assert_eq!(wrapped.event_type, "done");
        assert_eq!(wrapped.data["cancelled"], true);
    }
}
