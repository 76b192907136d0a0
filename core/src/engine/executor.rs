//! The streaming execution loop.
//!
//! `execute` returns the receiving end of an event channel fed by a
//! spawned task. The task drives the backend stream, assembles partial
//! tool calls, correlates file operations, and suspends through the
//! approval handler when the backend reports interrupts. Every execution
//! terminates with exactly one `done` or one `error`, never both.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_channel::Receiver;
use async_channel::Sender;
use dataagent_protocol::DoneEvent;
use dataagent_protocol::ErrorEvent;
use dataagent_protocol::Event;
use dataagent_protocol::EventMsg;
use dataagent_protocol::FileOperationEvent;
use dataagent_protocol::TextEvent;
use dataagent_protocol::TodoItem;
use dataagent_protocol::TodoUpdateEvent;
use dataagent_protocol::ToolCallEvent;
use dataagent_protocol::ToolResultEvent;
use futures::StreamExt;
use tracing::debug;
use tracing::info;

use crate::engine::backend::AiMessageChunk;
use crate::engine::backend::ContentBlock;
use crate::engine::backend::InterruptDecisions;
use crate::engine::backend::InterruptRequest;
use crate::engine::backend::MessageChunk;
use crate::engine::backend::ModelBackend;
use crate::engine::backend::RunConfig;
use crate::engine::backend::StreamChunk;
use crate::engine::backend::StreamInput;
use crate::engine::backend::ToolMessage;
use crate::engine::file_tracker::FileOpTracker;
use crate::error::DataAgentErr;
use crate::error::Result;
use crate::hitl::ApprovalHandler;
use crate::middleware::AgentState;
use crate::middleware::ChatMessage;
use crate::middleware::Middleware;
use crate::middleware::ModelRequest;
use crate::middleware::run_before_agent;
use crate::middleware::wrap_model_call;

/// Executes user input against a model backend, yielding a typed event
/// stream. Cheap to clone; clones share the backend and file tracker.
#[derive(Clone)]
pub struct AgentExecutor {
    backend: Arc<dyn ModelBackend>,
    hitl_handler: Option<Arc<dyn ApprovalHandler>>,
    assistant_id: Option<String>,
    /// Applied around every model call (memory, skills, rules, ...).
    middleware: Vec<Arc<dyn Middleware>>,
    file_tracker: Arc<FileOpTracker>,
}

impl AgentExecutor {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        hitl_handler: Option<Arc<dyn ApprovalHandler>>,
        assistant_id: Option<String>,
        middleware: Vec<Arc<dyn Middleware>>,
        file_tracker: Arc<FileOpTracker>,
    ) -> Self {
        Self {
            backend,
            hitl_handler,
            assistant_id,
            middleware,
            file_tracker,
        }
    }

    /// Start an execution. The returned channel yields events in emission
    /// order and closes after the terminator.
    pub fn execute(
        &self,
        user_input: &str,
        session_id: &str,
        context: Option<serde_json::Value>,
    ) -> Receiver<Event> {
        let (tx_event, rx_event) = async_channel::bounded(64);
        let executor = self.clone();
        let user_input = user_input.to_string();
        let session_id = session_id.to_string();
        if let Some(context) = context {
            debug!("execution context: {context}");
        }

        tokio::spawn(async move {
            if let Err(e) = executor.run_stream(&user_input, &session_id, &tx_event).await {
                info!("execution error: {e:#}");
                tx_event
                    .send(Event::new(EventMsg::Error(ErrorEvent {
                        error: e.to_string(),
                        recoverable: false,
                    })))
                    .await
                    .ok();
            }
        });

        rx_event
    }

    async fn run_stream(
        &self,
        user_input: &str,
        session_id: &str,
        tx_event: &Sender<Event>,
    ) -> Result<()> {
        let config = RunConfig {
            session_id: session_id.to_string(),
            assistant_id: self.assistant_id.clone(),
        };
        let state = AgentState {
            session_id: session_id.to_string(),
            assistant_id: self.assistant_id.clone().unwrap_or_default(),
        };
        // Hooks run their once-per-round setup (rule store reloads and
        // the like) before the first model call.
        let state_update = run_before_agent(&self.middleware, &state);
        if !state_update.is_empty() {
            debug!("agent state update: {}", serde_json::Value::Object(state_update));
        }

        let mut input = StreamInput::UserMessage {
            content: user_input.to_string(),
        };

        let mut displayed_tool_ids: HashSet<String> = HashSet::new();
        let mut buffers: HashMap<String, ToolCallBuffer> = HashMap::new();
        let mut pending_text = String::new();
        let mut current_todos: Option<Vec<TodoItem>> = None;

        loop {
            // Every loop iteration is one model call; the chain rewrites
            // the request (system prompt injection) each time.
            let request = wrap_model_call(
                &self.middleware,
                ModelRequest {
                    system_prompt: None,
                    messages: vec![ChatMessage::user(user_input)],
                    state: state.clone(),
                },
            );
            let mut pending_interrupts: Vec<InterruptRequest> = Vec::new();
            let mut stream = self.backend.stream(input, &request, &config).await?;

            while let Some(chunk) = stream.next().await {
                match chunk? {
                    StreamChunk::Update(update) => {
                        pending_interrupts.extend(update.interrupts);
                        if let Some(todos) = update.todos {
                            if current_todos.as_ref() != Some(&todos) {
                                current_todos = Some(todos.clone());
                                send(tx_event, EventMsg::TodoUpdate(TodoUpdateEvent { todos }))
                                    .await?;
                            }
                        }
                    }
                    StreamChunk::Message(MessageChunk::Tool(message)) => {
                        self.handle_tool_message(tx_event, message).await?;
                    }
                    StreamChunk::Message(MessageChunk::Ai(chunk)) => {
                        self.handle_ai_chunk(
                            tx_event,
                            chunk,
                            &mut buffers,
                            &mut displayed_tool_ids,
                            &mut pending_text,
                        )
                        .await?;
                    }
                }
            }

            if pending_interrupts.is_empty() {
                send(tx_event, EventMsg::Done(DoneEvent::completed())).await?;
                return Ok(());
            }

            match self.handle_hitl(&pending_interrupts, session_id).await {
                None => {
                    send(tx_event, EventMsg::Done(DoneEvent::cancelled())).await?;
                    return Ok(());
                }
                Some(decisions) => {
                    input = StreamInput::Resume { decisions };
                }
            }
        }
    }

    async fn handle_tool_message(
        &self,
        tx_event: &Sender<Event>,
        message: ToolMessage,
    ) -> Result<()> {
        send(
            tx_event,
            EventMsg::ToolResult(ToolResultEvent {
                tool_call_id: message.tool_call_id.clone(),
                result: message.content.clone(),
                status: message.status,
            }),
        )
        .await?;

        if let Some(record) =
            self.file_tracker
                .complete(&message.tool_call_id, &message.content, message.status)
        {
            send(
                tx_event,
                EventMsg::FileOperation(FileOperationEvent {
                    operation: record.tool_name,
                    file_path: record.display_path,
                    metrics: record.metrics,
                    diff: record.diff,
                    status: record.status,
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_ai_chunk(
        &self,
        tx_event: &Sender<Event>,
        chunk: AiMessageChunk,
        buffers: &mut HashMap<String, ToolCallBuffer>,
        displayed_tool_ids: &mut HashSet<String>,
        pending_text: &mut String,
    ) -> Result<()> {
        for block in chunk.content_blocks {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        pending_text.push_str(&text);
                        send(
                            tx_event,
                            EventMsg::Text(TextEvent {
                                content: text,
                                is_final: false,
                            }),
                        )
                        .await?;
                    }
                }
                ContentBlock::ToolCallChunk {
                    name,
                    args,
                    id,
                    index,
                } => {
                    let key = match (index, &id) {
                        (Some(index), _) => format!("index:{index}"),
                        (None, Some(id)) => format!("id:{id}"),
                        (None, None) => format!("unknown:{}", buffers.len()),
                    };
                    let buffer = buffers.entry(key.clone()).or_default();
                    buffer.absorb(name, args, id);

                    let Some((tool_name, tool_call_id, parsed_args)) = buffer.ready() else {
                        continue;
                    };

                    if displayed_tool_ids.insert(tool_call_id.clone()) {
                        self.file_tracker
                            .start_operation(&tool_name, &parsed_args, &tool_call_id);
                        send(
                            tx_event,
                            EventMsg::ToolCall(ToolCallEvent {
                                tool_name,
                                tool_args: parsed_args,
                                tool_call_id,
                            }),
                        )
                        .await?;
                    } else {
                        // A re-sent chunk for an announced call only
                        // refreshes the tracker, never re-emits.
                        self.file_tracker.update_args(&tool_call_id, &parsed_args);
                    }
                    buffers.remove(&key);
                }
            }
        }

        if chunk.is_last && !pending_text.is_empty() {
            send(
                tx_event,
                EventMsg::Text(TextEvent {
                    content: String::new(),
                    is_final: true,
                }),
            )
            .await?;
            pending_text.clear();
        }
        Ok(())
    }

    /// Resolve a round's interrupts into a decision map, or `None` when
    /// the round was rejected and the stream must end cancelled.
    async fn handle_hitl(
        &self,
        pending_interrupts: &[InterruptRequest],
        session_id: &str,
    ) -> Option<HashMap<String, InterruptDecisions>> {
        let Some(handler) = &self.hitl_handler else {
            // No handler attached: every action request auto-approves.
            return Some(
                pending_interrupts
                    .iter()
                    .map(|interrupt| {
                        (
                            interrupt.id.clone(),
                            InterruptDecisions {
                                decisions: interrupt
                                    .action_requests
                                    .iter()
                                    .map(|_| dataagent_protocol::Decision::approve())
                                    .collect(),
                            },
                        )
                    })
                    .collect(),
            );
        };

        let mut response = HashMap::new();
        for interrupt in pending_interrupts {
            let mut decisions = Vec::new();
            for action_request in &interrupt.action_requests {
                // Every action request is put to the handler; whether an
                // auto_approve_all answer suppresses later prompts is the
                // handler's own business.
                let decision = handler.request_approval(action_request, session_id).await;
                if decision.is_reject() {
                    return None;
                }
                decisions.push(decision);
            }
            response.insert(interrupt.id.clone(), InterruptDecisions { decisions });
        }
        Some(response)
    }
}

/// Accumulates partial tool-call chunks until name, id and complete args
/// are all known.
#[derive(Default)]
struct ToolCallBuffer {
    name: Option<String>,
    id: Option<String>,
    args_value: Option<serde_json::Value>,
    args_parts: Vec<String>,
}

impl ToolCallBuffer {
    fn absorb(
        &mut self,
        name: Option<String>,
        args: Option<serde_json::Value>,
        id: Option<String>,
    ) {
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            self.name = Some(name);
        }
        if let Some(id) = id.filter(|i| !i.is_empty()) {
            self.id = Some(id);
        }
        match args {
            Some(serde_json::Value::Object(obj)) => {
                self.args_value = Some(serde_json::Value::Object(obj));
                self.args_parts.clear();
            }
            Some(serde_json::Value::String(fragment)) => {
                // Merge string fragments, skipping exact repeats.
                if !fragment.is_empty() && self.args_parts.last() != Some(&fragment) {
                    self.args_parts.push(fragment);
                }
            }
            Some(serde_json::Value::Null) | None => {}
            Some(other) => {
                self.args_value = Some(other);
            }
        }
    }

    /// `(name, id, parsed_args)` once everything needed to announce the
    /// call is present.
    fn ready(&self) -> Option<(String, String, serde_json::Value)> {
        let name = self.name.clone()?;
        let id = self.id.clone()?;
        let parsed = match &self.args_value {
            Some(value) => value.clone(),
            None => {
                if self.args_parts.is_empty() {
                    return None;
                }
                let joined = self.args_parts.concat();
                serde_json::from_str::<serde_json::Value>(&joined).ok()?
            }
        };
        let parsed = if parsed.is_object() {
            parsed
        } else {
            serde_json::json!({ "value": parsed })
        };
        Some((name, id, parsed))
    }
}

async fn send(tx_event: &Sender<Event>, msg: EventMsg) -> Result<()> {
    tx_event
        .send(Event::new(msg))
        .await
        .map_err(|_| DataAgentErr::InternalAgentDied)
}
