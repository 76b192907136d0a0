//! Persistent agent memory: `<agent_root>/<agent_id>/agent.md`.
//!
//! The file is created lazily from the default text on first use, not at
//! startup. `reset` restores the default or copies another agent's
//! memory.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::error::DataAgentErr;
use crate::error::Result;
use crate::middleware::Middleware;
use crate::middleware::ModelRequest;
use crate::workspace::sanitize_user_id;

pub const AGENT_MEMORY_FILE: &str = "agent.md";

/// Default contents of a fresh `agent.md`.
pub fn default_agent_memory() -> &'static str {
    "# Agent Memory\n\nNo long-term memory recorded yet. Facts worth keeping across\nconversations get appended here.\n"
}

pub struct AgentMemoryStore {
    agent_root: PathBuf,
}

impl AgentMemoryStore {
    pub fn new(agent_root: impl Into<PathBuf>) -> Self {
        Self {
            agent_root: agent_root.into(),
        }
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agent_root.join(sanitize_user_id(agent_id))
    }

    pub fn memory_path(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join(AGENT_MEMORY_FILE)
    }

    /// Read the memory file, creating it with the default text first if
    /// it does not exist yet.
    pub fn load_or_init(&self, agent_id: &str) -> Result<String> {
        let path = self.memory_path(agent_id);
        if !path.exists() {
            self.save(agent_id, default_agent_memory())?;
            return Ok(default_agent_memory().to_string());
        }
        Ok(std::fs::read_to_string(path)?)
    }

    pub fn save(&self, agent_id: &str, content: &str) -> Result<()> {
        let path = self.memory_path(agent_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reset an agent's memory to the default, or to a copy of
    /// `from`'s memory.
    pub fn reset(&self, agent_id: &str, from: Option<&str>) -> Result<()> {
        let content = match from {
            Some(source) => {
                let source_path = self.memory_path(source);
                if !source_path.exists() {
                    return Err(DataAgentErr::AgentNotFound(source.to_string()));
                }
                std::fs::read_to_string(source_path)?
            }
            None => default_agent_memory().to_string(),
        };
        self.save(agent_id, &content)?;
        info!(
            "reset memory for agent {agent_id}{}",
            from.map(|f| format!(" from {f}")).unwrap_or_default()
        );
        Ok(())
    }

    pub fn list_agents(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.agent_root) else {
            return Vec::new();
        };
        let mut agents: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        agents.sort();
        agents
    }
}

/// Injects the agent's persistent memory into the system prompt.
pub struct AgentMemoryMiddleware {
    store: Arc<AgentMemoryStore>,
}

impl AgentMemoryMiddleware {
    pub fn new(store: Arc<AgentMemoryStore>) -> Self {
        Self { store }
    }
}

impl Middleware for AgentMemoryMiddleware {
    fn name(&self) -> &'static str {
        "agent_memory"
    }

    fn wrap_model_call(&self, request: ModelRequest) -> ModelRequest {
        if request.state.assistant_id.is_empty() {
            return request;
        }
        match self.store.load_or_init(&request.state.assistant_id) {
            Ok(memory) => request.append_system_prompt(&format!("## Agent Memory\n\n{memory}")),
            Err(e) => {
                tracing::warn!("failed to load agent memory: {e}");
                request
            }
        }
    }
}
