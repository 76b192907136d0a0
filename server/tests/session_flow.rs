//! End-to-end session flows over the runtime and chat handler, with a
//! scripted model backend standing in for the LLM.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dataagent_core::engine::AgentExecutor;
use dataagent_core::engine::AiMessageChunk;
use dataagent_core::engine::ContentBlock;
use dataagent_core::engine::FileOpTracker;
use dataagent_core::engine::InterruptRequest;
use dataagent_core::engine::MessageChunk;
use dataagent_core::engine::ModelBackend;
use dataagent_core::engine::RunConfig;
use dataagent_core::engine::StreamChunk;
use dataagent_core::engine::StreamInput;
use dataagent_core::engine::ToolMessage;
use dataagent_core::engine::UpdateChunk;
use dataagent_core::hitl::ApprovalHandler;
use dataagent_core::hitl::PendingHitlRegistry;
use dataagent_protocol::ActionRequest;
use dataagent_protocol::ToolStatus;
use dataagent_server::CAPACITY_CLOSE_CODE;
use dataagent_server::ChatHandler;
use dataagent_server::ClientConnection;
use dataagent_server::ExecutorFactory;
use dataagent_server::SessionRuntime;
use serde_json::Value;
use serde_json::json;

struct RecordingConnection {
    sent: Mutex<Vec<String>>,
    closed: Mutex<Option<(u16, String)>>,
}

impl RecordingConnection {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
        })
    }

    fn events(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    fn event_types(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e["event_type"].as_str().unwrap().to_string())
            .collect()
    }

    async fn wait_for(&self, event_type: &str) -> Value {
        for _ in 0..200 {
            if let Some(event) = self
                .events()
                .into_iter()
                .find(|e| e["event_type"] == event_type)
            {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for '{event_type}'; saw {:?}",
            self.event_types()
        );
    }
}

impl ClientConnection for RecordingConnection {
    fn send_text(&self, text: &str) -> std::io::Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        *self.closed.lock().unwrap() = Some((code, reason.to_string()));
    }
}

/// Replays scripted rounds; a `None` round hangs forever.
struct ScriptedBackend {
    rounds: Mutex<VecDeque<Option<Vec<StreamChunk>>>>,
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn stream(
        &self,
        _input: StreamInput,
        _request: &dataagent_core::middleware::ModelRequest,
        _config: &RunConfig,
    ) -> dataagent_core::Result<dataagent_core::engine::ChunkStream> {
        let round = self.rounds.lock().unwrap().pop_front().flatten();
        match round {
            Some(chunks) => Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))),
            None => Ok(Box::pin(futures::stream::pending())),
        }
    }
}

struct ScriptedFactory {
    rounds: Mutex<Option<VecDeque<Option<Vec<StreamChunk>>>>>,
}

impl ScriptedFactory {
    fn new(rounds: Vec<Option<Vec<StreamChunk>>>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(Some(rounds.into())),
        })
    }
}

#[async_trait]
impl ExecutorFactory for ScriptedFactory {
    async fn create_executor(
        &self,
        _session_id: &str,
        _user_id: &str,
        hitl_handler: Arc<dyn ApprovalHandler>,
    ) -> dataagent_core::Result<AgentExecutor> {
        let rounds = self.rounds.lock().unwrap().take().unwrap_or_default();
        let backend = Arc::new(ScriptedBackend {
            rounds: Mutex::new(rounds),
        });
        Ok(AgentExecutor::new(
            backend,
            Some(hitl_handler),
            Some("helper".to_string()),
            Vec::new(),
            Arc::new(FileOpTracker::new(None, 200)),
        ))
    }
}

fn handler_with(rounds: Vec<Option<Vec<StreamChunk>>>, max_connections: usize) -> ChatHandler {
    let runtime = Arc::new(SessionRuntime::new(
        max_connections,
        Arc::new(PendingHitlRegistry::new()),
    ));
    ChatHandler::new(runtime, ScriptedFactory::new(rounds), Duration::from_secs(5))
}

fn text_chunk(text: &str) -> StreamChunk {
    StreamChunk::Message(MessageChunk::Ai(AiMessageChunk {
        content_blocks: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        is_last: false,
    }))
}

fn last_chunk() -> StreamChunk {
    StreamChunk::Message(MessageChunk::Ai(AiMessageChunk {
        content_blocks: vec![],
        is_last: true,
    }))
}

fn tool_call_chunk(name: &str, args: Value, id: &str) -> StreamChunk {
    StreamChunk::Message(MessageChunk::Ai(AiMessageChunk {
        content_blocks: vec![ContentBlock::ToolCallChunk {
            name: Some(name.to_string()),
            args: Some(args),
            id: Some(id.to_string()),
            index: Some(0),
        }],
        is_last: false,
    }))
}

fn tool_result_chunk(id: &str, content: &str) -> StreamChunk {
    StreamChunk::Message(MessageChunk::Tool(ToolMessage {
        tool_call_id: id.to_string(),
        name: "ls".to_string(),
        content: content.to_string(),
        status: ToolStatus::Success,
    }))
}

fn interrupt_chunk(interrupt_id: &str) -> StreamChunk {
    StreamChunk::Update(UpdateChunk {
        interrupts: vec![InterruptRequest {
            id: interrupt_id.to_string(),
            action_requests: vec![ActionRequest {
                name: "ls".to_string(),
                args: json!({"path": "/workspace"}),
                description: Some("List files".to_string()),
            }],
        }],
        todos: None,
    })
}

fn chat(message: &str) -> String {
    json!({"type": "chat", "payload": {"message": message}}).to_string()
}

#[tokio::test]
async fn plain_chat_streams_text_and_done() {
    let handler = handler_with(
        vec![Some(vec![text_chunk("Hello"), last_chunk()])],
        4,
    );
    let conn = RecordingConnection::new();
    assert!(handler.handle_open(Arc::clone(&conn) as Arc<dyn ClientConnection>, "s1"));
    handler.handle_message("s1", &chat("hi")).await;

    let done = conn.wait_for("done").await;
    assert_eq!(done["data"]["cancelled"], false);

    let types = conn.event_types();
    assert_eq!(types, vec!["connected", "text", "text", "done"]);
    let events = conn.events();
    assert_eq!(events[1]["data"]["content"], "Hello");
    assert_eq!(events[1]["data"]["is_final"], false);
    assert_eq!(events[2]["data"]["content"], "");
    assert_eq!(events[2]["data"]["is_final"], true);
}

#[tokio::test]
async fn tool_approval_accepted_resumes_the_round() {
    let handler = handler_with(
        vec![
            Some(vec![
                tool_call_chunk("ls", json!({"path": "/workspace"}), "tc-1"),
                interrupt_chunk("ii-1"),
            ]),
            Some(vec![
                tool_result_chunk("tc-1", ".\n..\nfile.txt"),
                text_chunk("Done"),
                last_chunk(),
            ]),
        ],
        4,
    );
    let conn = RecordingConnection::new();
    handler.handle_open(Arc::clone(&conn) as Arc<dyn ClientConnection>, "s1");
    handler.handle_message("s1", &chat("list files")).await;

    let request = conn.wait_for("hitl_request").await;
    assert_eq!(request["data"]["action_requests"][0]["name"], "ls");
    assert!(request["data"]["interrupt_id"].as_str().unwrap().starts_with("hitl-"));

    handler
        .handle_message(
            "s1",
            &json!({"type": "hitl_decision", "payload": {"decisions": [{"type": "approve"}]}})
                .to_string(),
        )
        .await;

    let done = conn.wait_for("done").await;
    assert_eq!(done["data"]["cancelled"], false);

    let types = conn.event_types();
    assert_eq!(
        types,
        vec![
            "connected",
            "tool_call",
            "hitl_request",
            "tool_result",
            "text",
            "text",
            "done"
        ]
    );
    let events = conn.events();
    assert_eq!(events[3]["data"]["tool_call_id"], "tc-1");
    assert_eq!(events[3]["data"]["result"], ".\n..\nfile.txt");
}

#[tokio::test]
async fn tool_approval_rejected_cancels_the_round() {
    let handler = handler_with(
        vec![
            Some(vec![
                tool_call_chunk("ls", json!({"path": "/workspace"}), "tc-1"),
                interrupt_chunk("ii-1"),
            ]),
            Some(vec![tool_result_chunk("tc-1", "file.txt"), last_chunk()]),
        ],
        4,
    );
    let conn = RecordingConnection::new();
    handler.handle_open(Arc::clone(&conn) as Arc<dyn ClientConnection>, "s1");
    handler.handle_message("s1", &chat("list files")).await;

    conn.wait_for("hitl_request").await;
    handler
        .handle_message(
            "s1",
            &json!({"type": "hitl_decision", "payload": {"decisions": [{"type": "reject"}]}})
                .to_string(),
        )
        .await;

    let done = conn.wait_for("done").await;
    assert_eq!(done["data"]["cancelled"], true);
    assert!(!conn.event_types().contains(&"tool_result".to_string()));
}

#[tokio::test]
async fn capacity_refuses_the_third_connection() {
    let handler = handler_with(vec![], 2);
    let first = RecordingConnection::new();
    let second = RecordingConnection::new();
    let third = RecordingConnection::new();

    assert!(handler.handle_open(Arc::clone(&first) as Arc<dyn ClientConnection>, "s1"));
    assert!(handler.handle_open(Arc::clone(&second) as Arc<dyn ClientConnection>, "s2"));
    assert!(!handler.handle_open(Arc::clone(&third) as Arc<dyn ClientConnection>, "s3"));

    assert_eq!(first.event_types(), vec!["connected"]);
    assert_eq!(second.event_types(), vec!["connected"]);
    assert!(third.event_types().is_empty());
    assert_eq!(
        *third.closed.lock().unwrap(),
        Some((CAPACITY_CLOSE_CODE, "Service at capacity".to_string()))
    );
}

#[tokio::test]
async fn malformed_and_unknown_messages_get_coded_errors() {
    let handler = handler_with(vec![], 4);
    let conn = RecordingConnection::new();
    handler.handle_open(Arc::clone(&conn) as Arc<dyn ClientConnection>, "s1");

    handler.handle_message("s1", "not even json").await;
    handler.handle_message("s1", r#"{"type":"chat"}"#).await;
    handler.handle_message("s1", &chat("")).await;
    handler
        .handle_message("s1", &json!({"type": "shout", "payload": {}}).to_string())
        .await;
    handler
        .handle_message("s1", &json!({"type": "ping", "payload": {}}).to_string())
        .await;

    let events = conn.events();
    let codes: Vec<&str> = events
        .iter()
        .filter(|e| e["event_type"] == "error")
        .map(|e| e["data"]["error_code"].as_str().unwrap())
        .collect();
    assert_eq!(
        codes,
        vec![
            "INVALID_MESSAGE",
            "INVALID_MESSAGE",
            "EMPTY_MESSAGE",
            "UNKNOWN_MESSAGE_TYPE"
        ]
    );
    assert_eq!(conn.event_types().last().map(String::as_str), Some("pong"));
}

#[tokio::test]
async fn decision_without_pending_request_is_an_error() {
    let handler = handler_with(vec![], 4);
    let conn = RecordingConnection::new();
    handler.handle_open(Arc::clone(&conn) as Arc<dyn ClientConnection>, "s1");

    handler
        .handle_message(
            "s1",
            &json!({"type": "hitl_decision", "payload": {"decisions": [{"type": "approve"}]}})
                .to_string(),
        )
        .await;
    handler
        .handle_message(
            "s1",
            &json!({"type": "hitl_decision", "payload": {"decisions": []}}).to_string(),
        )
        .await;

    let events = conn.events();
    assert_eq!(events[1]["data"]["error_code"], "NO_PENDING_DECISION");
    assert_eq!(events[2]["data"]["error_code"], "EMPTY_DECISION");
}

#[tokio::test]
async fn cancel_aborts_the_active_task() {
    // A round that hangs forever keeps the task active.
    let handler = handler_with(vec![None], 4);
    let conn = RecordingConnection::new();
    handler.handle_open(Arc::clone(&conn) as Arc<dyn ClientConnection>, "s1");
    handler.handle_message("s1", &chat("think forever")).await;

    // Give the task a moment to start.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handler.runtime().has_active_task("s1"));

    handler
        .handle_message("s1", &json!({"type": "cancel", "payload": {}}).to_string())
        .await;

    let done = conn.wait_for("done").await;
    assert_eq!(done["data"]["cancelled"], true);
    assert_eq!(done["data"]["reason"], "user_cancelled");
    assert!(!handler.runtime().has_active_task("s1"));

    // Cancelling again reports no active task.
    handler
        .handle_message("s1", &json!({"type": "cancel", "payload": {}}).to_string())
        .await;
    let last = conn.events().into_iter().last().unwrap();
    assert_eq!(last["data"]["reason"], "no_active_task");
}

#[tokio::test]
async fn approval_timeout_rejects_and_cancels() {
    let runtime = Arc::new(SessionRuntime::new(4, Arc::new(PendingHitlRegistry::new())));
    let handler = ChatHandler::new(
        Arc::clone(&runtime),
        ScriptedFactory::new(vec![
            Some(vec![interrupt_chunk("ii-1")]),
            Some(vec![last_chunk()]),
        ]),
        Duration::from_millis(50),
    );
    let conn = RecordingConnection::new();
    handler.handle_open(Arc::clone(&conn) as Arc<dyn ClientConnection>, "s1");
    handler.handle_message("s1", &chat("do something risky")).await;

    // No decision arrives: the wait times out, the handler rejects, and
    // the round ends cancelled.
    let done = conn.wait_for("done").await;
    assert_eq!(done["data"]["cancelled"], true);
}

#[tokio::test]
async fn disconnect_then_send_returns_false() {
    let handler = handler_with(vec![None], 4);
    let conn = RecordingConnection::new();
    handler.handle_open(Arc::clone(&conn) as Arc<dyn ClientConnection>, "s1");
    handler.handle_message("s1", &chat("hang")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    handler.handle_close("s1");
    let runtime = handler.runtime();
    assert!(!runtime.has_connection("s1"));
    assert!(!runtime.has_active_task("s1"));
    assert!(!runtime.send_event(
        "s1",
        &dataagent_protocol::Event::new(dataagent_protocol::EventMsg::Done(
            dataagent_protocol::DoneEvent::completed()
        ))
    ));
}
