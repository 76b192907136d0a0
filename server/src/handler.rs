//! Dispatch of inbound client messages for one session.
//!
//! Every inbound frame must be a `{type, payload}` record. Known types
//! are `chat`, `hitl_decision`, `cancel` and `ping`; anything else is
//! answered with a coded `error` event and the session continues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dataagent_core::engine::AgentExecutor;
use dataagent_core::hitl::ApprovalHandler;
use dataagent_protocol::ChatPayload;
use dataagent_protocol::ClientEnvelope;
use dataagent_protocol::ErrorCode;
use dataagent_protocol::HitlDecisionPayload;
use dataagent_protocol::ServerEvent;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::hitl::SessionHitlHandler;
use crate::runtime::ClientConnection;
use crate::runtime::SessionRuntime;

/// Builds an executor for a session. The factory owns backend choice,
/// tool wiring and MCP connection loading for the session's user.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn create_executor(
        &self,
        session_id: &str,
        user_id: &str,
        hitl_handler: Arc<dyn ApprovalHandler>,
    ) -> dataagent_core::Result<AgentExecutor>;
}

pub struct ChatHandler {
    runtime: Arc<SessionRuntime>,
    factory: Arc<dyn ExecutorFactory>,
    hitl_timeout: Duration,
    /// session_id -> executor, reused across turns of the same session.
    executors: Mutex<HashMap<String, AgentExecutor>>,
}

impl ChatHandler {
    pub fn new(
        runtime: Arc<SessionRuntime>,
        factory: Arc<dyn ExecutorFactory>,
        hitl_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            factory,
            hitl_timeout,
            executors: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> Arc<SessionRuntime> {
        Arc::clone(&self.runtime)
    }

    /// Accept a connection and emit the `connected` event, which is
    /// always the first event of an accepted connection.
    pub fn handle_open(&self, conn: Arc<dyn ClientConnection>, session_id: &str) -> bool {
        if !self.runtime.connect(conn, session_id) {
            return false;
        }
        self.runtime
            .send(session_id, &ServerEvent::connected(session_id));
        true
    }

    /// Tear down the session's runtime state. The executor cache entry
    /// survives so a reconnect resumes the same conversation thread.
    pub fn handle_close(&self, session_id: &str) {
        self.runtime.disconnect(session_id);
    }

    pub async fn handle_message(&self, session_id: &str, raw: &str) {
        let envelope: ClientEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(_) => {
                self.send_error(
                    session_id,
                    ErrorCode::InvalidMessage,
                    "Message must contain 'type' and 'payload' fields",
                );
                return;
            }
        };

        match envelope.kind.as_str() {
            "chat" => self.handle_chat(session_id, envelope.payload).await,
            "hitl_decision" => self.handle_hitl_decision(session_id, envelope.payload),
            "cancel" => self.handle_cancel(session_id),
            "ping" => {
                self.runtime.send(session_id, &ServerEvent::pong());
            }
            other => {
                self.send_error(
                    session_id,
                    ErrorCode::UnknownMessageType,
                    format!("Unknown message type: {other}"),
                );
            }
        }
    }

    async fn handle_chat(&self, session_id: &str, payload: serde_json::Value) {
        let payload: ChatPayload = serde_json::from_value(payload).unwrap_or_default();
        if payload.message.is_empty() {
            self.send_error(session_id, ErrorCode::EmptyMessage, "Message cannot be empty");
            return;
        }
        let user_id = payload.user_id.as_deref().unwrap_or("anonymous");

        let executor = match self.get_or_create_executor(session_id, user_id).await {
            Ok(executor) => executor,
            Err(e) => {
                warn!("failed to create executor for session {session_id}: {e}");
                self.send_error(
                    session_id,
                    ErrorCode::ExecutorError,
                    format!("Failed to create agent executor: {e}"),
                );
                return;
            }
        };

        let rx_event = executor.execute(&payload.message, session_id, None);
        let runtime = Arc::clone(&self.runtime);
        let session = session_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Ok(event) = rx_event.recv().await {
                if !runtime.send_event(&session, &event) {
                    debug!("stopping event forwarding for session {session}");
                    break;
                }
            }
        });
        self.runtime.start_task(session_id, forwarder);
    }

    fn handle_hitl_decision(&self, session_id: &str, payload: serde_json::Value) {
        let payload: HitlDecisionPayload = serde_json::from_value(payload).unwrap_or_default();
        let Some(decision) = payload.decisions.into_iter().next() else {
            self.send_error(
                session_id,
                ErrorCode::EmptyDecision,
                "Decision list cannot be empty",
            );
            return;
        };
        if !self.runtime.resolve_decision(session_id, decision) {
            self.send_error(
                session_id,
                ErrorCode::NoPendingDecision,
                "No pending HITL decision to resolve",
            );
        }
    }

    fn handle_cancel(&self, session_id: &str) {
        let cancelled = self.runtime.cancel_task(session_id);
        let reason = if cancelled {
            "user_cancelled"
        } else {
            "no_active_task"
        };
        self.runtime.send(
            session_id,
            &ServerEvent::new("done", json!({ "cancelled": true, "reason": reason })),
        );
    }

    async fn get_or_create_executor(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> dataagent_core::Result<AgentExecutor> {
        let mut executors = self.executors.lock().await;
        if let Some(executor) = executors.get(session_id) {
            return Ok(executor.clone());
        }
        let hitl_handler: Arc<dyn ApprovalHandler> = Arc::new(SessionHitlHandler::new(
            Arc::clone(&self.runtime),
            session_id,
            self.hitl_timeout,
        ));
        let executor = self
            .factory
            .create_executor(session_id, user_id, hitl_handler)
            .await?;
        executors.insert(session_id.to_string(), executor.clone());
        Ok(executor)
    }

    fn send_error(&self, session_id: &str, code: ErrorCode, message: impl Into<String>) {
        self.runtime
            .send(session_id, &ServerEvent::error(code, message, true));
    }
}
