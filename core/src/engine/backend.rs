//! The consumed interface of a streaming model backend.
//!
//! The backend multiplexes two logical modes into one stream: `update`
//! chunks carry structural changes (interrupts, todo lists) and
//! `message` chunks carry model output (tool results, text and tool-call
//! deltas). Chunks are serde-tagged so out-of-process backends can speak
//! the same shapes over a pipe.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use dataagent_protocol::ActionRequest;
use dataagent_protocol::Decision;
use dataagent_protocol::TodoItem;
use dataagent_protocol::ToolStatus;
use futures::Stream;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::middleware::ModelRequest;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Input seeding one round of the stream loop.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamInput {
    UserMessage { content: String },
    /// Resume after a HITL round with the consolidated decision map,
    /// keyed by interrupt id.
    Resume { decisions: HashMap<String, InterruptDecisions> },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InterruptDecisions {
    pub decisions: Vec<Decision>,
}

/// Per-execution configuration passed to the backend. `session_id` is
/// the thread key: the backend keeps conversation state per session.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub session_id: String,
    pub assistant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StreamChunk {
    Update(UpdateChunk),
    Message(MessageChunk),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct UpdateChunk {
    #[serde(default)]
    pub interrupts: Vec<InterruptRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
}

/// A suspension emitted by the backend: the model wants one or more
/// actions approved before it continues.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InterruptRequest {
    pub id: String,
    pub action_requests: Vec<ActionRequest>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageChunk {
    Tool(ToolMessage),
    Ai(AiMessageChunk),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolMessage {
    pub tool_call_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "success")]
    pub status: ToolStatus,
}

fn success() -> ToolStatus {
    ToolStatus::Success
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AiMessageChunk {
    #[serde(default)]
    pub content_blocks: Vec<ContentBlock>,
    /// Marks the final chunk of the message.
    #[serde(default)]
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    /// A partial tool invocation. `args` may be a JSON object or a
    /// string fragment accumulated across chunks; `index` correlates
    /// fragments of the same call.
    #[serde(alias = "tool_call")]
    ToolCallChunk {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        args: Option<serde_json::Value>,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        index: Option<u64>,
    },
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Issue one model call. `request` carries the middleware-augmented
    /// system prompt and message context; `input` seeds or resumes the
    /// round.
    async fn stream(
        &self,
        input: StreamInput,
        request: &ModelRequest,
        config: &RunConfig,
    ) -> Result<ChunkStream>;
}
