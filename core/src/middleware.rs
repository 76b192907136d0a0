//! The middleware chain applied around every model call.
//!
//! Hooks are deterministic functions of `(request, state)` apart from the
//! I/O they explicitly perform (reading the memory file, reading skill
//! frontmatters, reloading rule stores). The backend applies the chain on
//! each model call; `before_agent_state_update` runs once per round.

use serde::Deserialize;
use serde::Serialize;

/// Minimal agent state visible to middleware hooks.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub session_id: String,
    pub assistant_id: String,
}

/// Keys merged back into the agent state by `before_agent_state_update`.
pub type StateUpdate = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A model call about to be issued. Middleware may rewrite the system
/// prompt or the message list before the backend sees it.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub state: AgentState,
}

impl ModelRequest {
    /// Append `section` to the system prompt, separated by a blank line.
    pub fn append_system_prompt(mut self, section: &str) -> Self {
        if section.is_empty() {
            return self;
        }
        self.system_prompt = Some(match self.system_prompt.take() {
            Some(existing) => format!("{existing}\n\n{section}"),
            None => section.to_string(),
        });
        self
    }
}

pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn before_agent_state_update(&self, _state: &AgentState) -> Option<StateUpdate> {
        None
    }

    fn wrap_model_call(&self, request: ModelRequest) -> ModelRequest {
        request
    }
}

/// Run `before_agent_state_update` for every hook, merging the updates.
pub fn run_before_agent(middlewares: &[std::sync::Arc<dyn Middleware>], state: &AgentState) -> StateUpdate {
    let mut merged = StateUpdate::new();
    for mw in middlewares {
        if let Some(update) = mw.before_agent_state_update(state) {
            for (k, v) in update {
                merged.insert(k, v);
            }
        }
    }
    merged
}

/// Thread a model request through every hook in order.
pub fn wrap_model_call(
    middlewares: &[std::sync::Arc<dyn Middleware>],
    mut request: ModelRequest,
) -> ModelRequest {
    for mw in middlewares {
        request = mw.wrap_model_call(request);
    }
    request
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    struct Suffixer(&'static str);

    impl Middleware for Suffixer {
        fn name(&self) -> &'static str {
            "suffixer"
        }

        fn wrap_model_call(&self, request: ModelRequest) -> ModelRequest {
            request.append_system_prompt(self.0)
        }
    }

    #[test]
    fn hooks_run_in_order() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Suffixer("one")), Arc::new(Suffixer("two"))];
        let request = wrap_model_call(&chain, ModelRequest::default());
        assert_eq!(request.system_prompt.as_deref(), Some("one\n\ntwo"));
    }

    #[test]
    fn empty_section_leaves_prompt_untouched() {
        let request = ModelRequest::default().append_system_prompt("");
        assert_eq!(request.system_prompt, None);
    }
}
