//! In-session approval: the decision arrives as a later `hitl_decision`
//! message on the same connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dataagent_core::hitl::ApprovalHandler;
use dataagent_core::hitl::build_human_tool_args;
use dataagent_core::hitl::build_tool_approval_args;
use dataagent_protocol::ActionRequest;
use dataagent_protocol::Decision;
use dataagent_protocol::Event;
use dataagent_protocol::EventMsg;
use dataagent_protocol::HitlRequestEvent;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::runtime::SessionRuntime;
use crate::runtime::WaitOutcome;

pub struct SessionHitlHandler {
    runtime: Arc<SessionRuntime>,
    session_id: String,
    timeout: Duration,
}

impl SessionHitlHandler {
    pub fn new(runtime: Arc<SessionRuntime>, session_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runtime,
            session_id: session_id.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ApprovalHandler for SessionHitlHandler {
    async fn request_approval(
        &self,
        action_request: &ActionRequest,
        _session_id: &str,
    ) -> Decision {
        let interrupt_id = format!("hitl-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let hitl_args = if action_request.name == "human" {
            build_human_tool_args(&action_request.args)
        } else {
            build_tool_approval_args(action_request)
        };

        info!(
            "requesting in-session approval {interrupt_id} for session {}, tool: {}",
            self.session_id, action_request.name
        );
        // Register before the request goes out so an immediate decision
        // cannot race the slot.
        let rx = self.runtime.register_decision_slot(&self.session_id);
        self.runtime.send_event(
            &self.session_id,
            &Event::new(EventMsg::HitlRequest(HitlRequestEvent {
                interrupt_id,
                action_requests: vec![action_request.clone()],
                hitl_args: Some(hitl_args),
            })),
        );

        match self
            .runtime
            .await_decision(&self.session_id, rx, self.timeout)
            .await
        {
            WaitOutcome::Decision(decision) => decision,
            WaitOutcome::TimedOut => {
                warn!("approval timed out for session {}", self.session_id);
                Decision::reject("Approval timeout")
            }
            WaitOutcome::Cancelled => Decision::reject("Request cancelled"),
        }
    }
}
