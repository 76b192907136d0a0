// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Human-in-the-loop approval: the rendezvous between an in-flight tool
//! call and an out-of-band decision.
//!
//! A pending request is a one-shot slot keyed by
//! `(session_id, interrupt_id)`. The waiting side parks on the slot with
//! a timeout; the deciding side resolves it from a later client message
//! or a separate HTTP request. Timeouts and cancellations both surface
//! as rejections so the pipeline treats them like an explicit reject.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dataagent_protocol::ActionRequest;
use dataagent_protocol::Decision;
use dataagent_protocol::Event;
use dataagent_protocol::EventMsg;
use dataagent_protocol::HitlRequestEvent;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Ask a human to approve one action. Never errors: timeouts and
    /// cancellations come back as reject decisions.
    async fn request_approval(&self, action_request: &ActionRequest, session_id: &str)
    -> Decision;
}

/// Callback used to push events toward the session's client.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Process-wide registry of pending approval slots.
#[derive(Default)]
pub struct PendingHitlRegistry {
    pending: Mutex<HashMap<(String, String), oneshot::Sender<Decision>>>,
}

impl PendingHitlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-shot slot. Registering over an unresolved slot
    /// replaces it (the old waiter observes a cancellation).
    pub fn register(&self, session_id: &str, interrupt_id: &str) -> oneshot::Receiver<Decision> {
        let (tx, rx) = oneshot::channel();
        let key = (session_id.to_string(), interrupt_id.to_string());
        let mut pending = self.pending.lock().unwrap();
        if pending.insert(key, tx).is_some() {
            warn!("replaced pending HITL request {session_id}/{interrupt_id}");
        }
        rx
    }

    pub fn remove(&self, session_id: &str, interrupt_id: &str) {
        self.pending
            .lock()
            .unwrap()
            .remove(&(session_id.to_string(), interrupt_id.to_string()));
    }

    /// Deliver a decision. Returns `false` when no slot is pending (the
    /// request is unknown or already resolved); the duplicate is logged
    /// and ignored.
    pub fn resolve_request(&self, session_id: &str, interrupt_id: &str, decision: Decision) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap()
            .remove(&(session_id.to_string(), interrupt_id.to_string()));
        match sender {
            Some(tx) => {
                info!("HITL request resolved: {session_id}/{interrupt_id}");
                tx.send(decision).ok();
                true
            }
            None => {
                warn!("no pending HITL request: {session_id}/{interrupt_id}");
                false
            }
        }
    }

    pub fn has_pending_request(&self, session_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap()
            .keys()
            .any(|(sess, _)| sess == session_id)
    }

    /// Drop every slot belonging to `session_id`; their waiters observe
    /// a cancellation. Returns the number of cancelled requests.
    pub fn cancel_pending_requests(&self, session_id: &str) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let keys: Vec<_> = pending
            .keys()
            .filter(|(sess, _)| sess == session_id)
            .cloned()
            .collect();
        for key in &keys {
            pending.remove(key);
        }
        if !keys.is_empty() {
            info!(
                "cancelled {} pending HITL requests for session {session_id}",
                keys.len()
            );
        }
        keys.len()
    }
}

/// Approval handler for stream-mode flows: emits an `hitl_request`
/// event, parks on the registry, and expects the decision to arrive via
/// a separate request calling
/// [`PendingHitlRegistry::resolve_request`].
pub struct StreamHitlHandler {
    registry: Arc<PendingHitlRegistry>,
    session_id: String,
    send_event: EventSink,
    timeout: Duration,
}

impl StreamHitlHandler {
    pub fn new(
        registry: Arc<PendingHitlRegistry>,
        session_id: impl Into<String>,
        send_event: EventSink,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
            send_event,
            timeout,
        }
    }
}

#[async_trait]
impl ApprovalHandler for StreamHitlHandler {
    async fn request_approval(
        &self,
        action_request: &ActionRequest,
        _session_id: &str,
    ) -> Decision {
        let interrupt_id = format!("hitl-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let rx = self.registry.register(&self.session_id, &interrupt_id);

        let hitl_args = if action_request.name == "human" {
            build_human_tool_args(&action_request.args)
        } else {
            build_tool_approval_args(action_request)
        };
        info!(
            "sending HITL request {interrupt_id} for session {}, tool: {}",
            self.session_id, action_request.name
        );
        (self.send_event)(Event::new(EventMsg::HitlRequest(HitlRequestEvent {
            interrupt_id: interrupt_id.clone(),
            action_requests: vec![action_request.clone()],
            hitl_args: Some(hitl_args),
        })));

        let decision = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => Decision::reject("Request cancelled"),
            Err(_) => {
                warn!("HITL request {interrupt_id} timed out");
                Decision::reject("Approval timeout")
            }
        };
        self.registry.remove(&self.session_id, &interrupt_id);
        decision
    }
}

/// The `human` tool carries its own UI parameters; forward them in the
/// shape the frontend interaction card expects.
pub fn build_human_tool_args(tool_args: &serde_json::Value) -> serde_json::Value {
    let interaction_type = tool_args
        .get("interaction_type")
        .and_then(|v| v.as_str())
        .unwrap_or("confirm");

    let mut hitl_args = json!({
        "type": interaction_type,
        "title": tool_args.get("title").and_then(|v| v.as_str()).unwrap_or("User interaction"),
        "message": tool_args.get("message").and_then(|v| v.as_str()).unwrap_or(""),
    });

    match interaction_type {
        "choice" => {
            hitl_args["options"] = tool_args.get("options").cloned().unwrap_or(json!([]));
        }
        "confirm" => {
            hitl_args["confirmText"] = json!(
                tool_args
                    .get("confirm_text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Confirm")
            );
            hitl_args["cancelText"] = json!(
                tool_args
                    .get("cancel_text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Cancel")
            );
        }
        "input" => {
            if let Some(placeholder) = tool_args.get("placeholder") {
                hitl_args["placeholder"] = placeholder.clone();
            }
            if let Some(default_value) = tool_args.get("default_value") {
                hitl_args["defaultValue"] = default_value.clone();
            }
        }
        "form" => {
            hitl_args["fields"] = tool_args.get("fields").cloned().unwrap_or(json!([]));
        }
        _ => {}
    }

    if let Some(timeout) = tool_args.get("timeout") {
        hitl_args["timeout"] = timeout.clone();
    }
    hitl_args
}

/// Ordinary tools get a confirm-style approval card.
pub fn build_tool_approval_args(action_request: &ActionRequest) -> serde_json::Value {
    let tool_name = action_request.name.as_str();
    let args = &action_request.args;

    let detail = match tool_name {
        "shell" => format!(
            "Command: `{}`",
            args.get("command").and_then(|v| v.as_str()).unwrap_or("")
        ),
        "write_file" | "edit_file" => format!(
            "File: `{}`",
            args.get("file_path").and_then(|v| v.as_str()).unwrap_or("")
        ),
        _ => action_request
            .description
            .clone()
            .unwrap_or_else(|| format!("Arguments: {args}")),
    };

    json!({
        "type": "confirm",
        "title": format!("Tool approval: {tool_name}"),
        "message": format!("The agent wants to run the following action:\n\n{detail}\n\nAllow it?"),
        "confirmText": "Allow",
        "cancelText": "Reject",
    })
}
