//! The event stream emitted by an agent execution.
//!
//! Every event is encoded as a self-describing JSON record: the
//! `event_type` field is the discriminant and `timestamp` is seconds since
//! the Unix epoch. Decoding is strict about the discriminant so that
//! protocol drift between server and client fails loudly instead of being
//! silently dropped.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Seconds since the Unix epoch, as carried by every encoded event.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// An event plus the moment it was emitted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub msg: EventMsg,
    pub timestamp: f64,
}

impl Event {
    /// Stamp `msg` with the current time.
    pub fn new(msg: EventMsg) -> Self {
        Self {
            msg,
            timestamp: unix_timestamp(),
        }
    }

    #[expect(clippy::expect_used)]
    pub fn encode(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("event serialization is infallible")
    }

    /// Decode a self-describing event record, failing with a typed error
    /// when the discriminant is absent or unknown.
    pub fn decode(value: serde_json::Value) -> Result<Self, EventDecodeError> {
        let tag = match value.get("event_type") {
            Some(serde_json::Value::String(tag)) => tag.clone(),
            _ => return Err(EventDecodeError::MissingEventType),
        };
        if !KNOWN_EVENT_TYPES.contains(&tag.as_str()) {
            return Err(EventDecodeError::UnknownEventType(tag));
        }
        serde_json::from_value(value).map_err(EventDecodeError::Malformed)
    }
}

const KNOWN_EVENT_TYPES: &[&str] = &[
    "text",
    "tool_call",
    "tool_result",
    "hitl_request",
    "todo_update",
    "file_operation",
    "rules_applied",
    "error",
    "done",
];

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("event record has no `event_type` field")]
    MissingEventType,

    #[error("unknown event_type: `{0}`")]
    UnknownEventType(String),

    #[error("malformed event record: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Response event from an agent execution.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventMsg {
    /// Streaming assistant text. A final marker with empty content closes
    /// the current text block.
    Text(TextEvent),

    /// A fully assembled tool invocation. Emitted at most once per
    /// `tool_call_id` no matter how many partial chunks arrived.
    ToolCall(ToolCallEvent),

    /// Result of an earlier tool call with the same `tool_call_id`.
    ToolResult(ToolResultEvent),

    /// The execution is suspended awaiting a human decision.
    HitlRequest(HitlRequestEvent),

    /// The agent's todo list changed.
    TodoUpdate(TodoUpdateEvent),

    /// A file read/write/edit completed, with metrics and an optional
    /// unified diff.
    FileOperation(FileOperationEvent),

    /// Which rules were injected into the model call.
    RulesApplied(RulesAppliedEvent),

    Error(ErrorEvent),

    /// Terminator. Exactly one `done` or one `error` ends every round.
    Done(DoneEvent),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TextEvent {
    pub content: String,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolCallEvent {
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub tool_call_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolResultEvent {
    pub tool_call_id: String,
    pub result: String,
    pub status: ToolStatus,
}

/// One action the model wants a human to approve.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ActionRequest {
    pub name: String,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HitlRequestEvent {
    pub interrupt_id: String,
    pub action_requests: Vec<ActionRequest>,
    /// UI parameters forwarded verbatim (populated for the `human` tool).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hitl_args: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TodoUpdateEvent {
    pub todos: Vec<TodoItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileOpMetrics {
    pub lines_read: u64,
    pub lines_written: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileOperationEvent {
    pub operation: String,
    pub file_path: String,
    pub metrics: FileOpMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TriggeredRule {
    pub name: String,
    pub scope: String,
    pub match_reason: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuleConflict {
    pub rule1: String,
    pub rule2: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RulesAppliedEvent {
    pub triggered_rules: Vec<TriggeredRule>,
    pub skipped_count: u64,
    pub conflicts: Vec<RuleConflict>,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorEvent {
    pub error: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DoneEvent {
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl DoneEvent {
    pub fn completed() -> Self {
        Self {
            cancelled: false,
            token_usage: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            token_usage: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_events() -> Vec<EventMsg> {
        vec![
            EventMsg::Text(TextEvent {
                content: "Hello".to_string(),
                is_final: false,
            }),
            EventMsg::ToolCall(ToolCallEvent {
                tool_name: "ls".to_string(),
                tool_args: serde_json::json!({"path": "/workspace"}),
                tool_call_id: "tc-1".to_string(),
            }),
            EventMsg::ToolResult(ToolResultEvent {
                tool_call_id: "tc-1".to_string(),
                result: ".\n..\nfile.txt".to_string(),
                status: ToolStatus::Success,
            }),
            EventMsg::HitlRequest(HitlRequestEvent {
                interrupt_id: "ii-1".to_string(),
                action_requests: vec![ActionRequest {
                    name: "ls".to_string(),
                    args: serde_json::json!({"path": "/workspace"}),
                    description: Some("List files".to_string()),
                }],
                hitl_args: None,
            }),
            EventMsg::TodoUpdate(TodoUpdateEvent {
                todos: vec![TodoItem {
                    content: "write tests".to_string(),
                    status: TodoStatus::InProgress,
                }],
            }),
            EventMsg::FileOperation(FileOperationEvent {
                operation: "write_file".to_string(),
                file_path: "notes.md".to_string(),
                metrics: FileOpMetrics {
                    lines_written: 3,
                    lines_added: 3,
                    ..Default::default()
                },
                diff: Some("+a\n+b\n+c\n".to_string()),
                status: ToolStatus::Success,
            }),
            EventMsg::RulesApplied(RulesAppliedEvent {
                triggered_rules: vec![TriggeredRule {
                    name: "style".to_string(),
                    scope: "user".to_string(),
                    match_reason: "inclusion is 'always'".to_string(),
                }],
                skipped_count: 2,
                conflicts: vec![],
                total_size: 512,
            }),
            EventMsg::Error(ErrorEvent {
                error: "backend unreachable".to_string(),
                recoverable: false,
            }),
            EventMsg::Done(DoneEvent {
                cancelled: false,
                token_usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 42,
                }),
            }),
        ]
    }

    #[test]
    fn every_event_round_trips() {
        for msg in sample_events() {
            let event = Event::new(msg);
            let encoded = event.encode();
            assert!(encoded.get("event_type").is_some());
            assert!(encoded.get("timestamp").is_some());
            let decoded = Event::decode(encoded).unwrap();
            assert_eq!(event, decoded);
        }
    }

    #[test]
    fn discriminant_matches_wire_name() {
        let event = Event::new(EventMsg::Done(DoneEvent::completed()));
        let encoded = event.encode();
        assert_eq!(encoded["event_type"], "done");
        assert_eq!(encoded["cancelled"], false);
    }

    #[test]
    fn unknown_event_type_is_a_typed_error() {
        let value = serde_json::json!({"event_type": "telemetry", "timestamp": 1.0});
        match Event::decode(value) {
            Err(EventDecodeError::UnknownEventType(tag)) => assert_eq!(tag, "telemetry"),
            other => panic!("expected UnknownEventType, got {other:?}"),
        }
    }

    #[test]
    fn missing_event_type_is_a_typed_error() {
        let value = serde_json::json!({"content": "hi", "timestamp": 1.0});
        assert!(matches!(
            Event::decode(value),
            Err(EventDecodeError::MissingEventType)
        ));
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let event = Event::new(EventMsg::Done(DoneEvent::completed()));
        let encoded = event.encode();
        assert!(encoded.get("token_usage").is_none());
    }
}
