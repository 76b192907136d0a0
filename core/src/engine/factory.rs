//! Assembles executors for real traffic: per-user rule store, sandboxed
//! file tracker, and the middleware chain (memory, skills, rules) that
//! the backend applies on every model call.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::engine::backend::ModelBackend;
use crate::engine::executor::AgentExecutor;
use crate::engine::file_tracker::FileOpTracker;
use crate::error::Result;
use crate::hitl::ApprovalHandler;
use crate::memory::AgentMemoryMiddleware;
use crate::memory::AgentMemoryStore;
use crate::middleware::Middleware;
use crate::rules::FileRuleStore;
use crate::rules::RulesMiddleware;
use crate::skills::SkillsMiddleware;
use crate::workspace::SandboxedFs;
use crate::workspace::WorkspaceManager;
use crate::workspace::sanitize_user_id;

/// Per-agent assembly options.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub assistant_id: Option<String>,
    pub enable_memory: bool,
    pub enable_skills: bool,
    pub enable_rules: bool,
    pub rules_debug_mode: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            assistant_id: None,
            enable_memory: true,
            enable_skills: true,
            enable_rules: true,
            rules_debug_mode: false,
        }
    }
}

pub struct AgentFactory {
    config: Config,
    workspace_manager: Arc<WorkspaceManager>,
    /// `<project_root>/.dataagent/rules/`, when running inside a project.
    project_rules_dir: Option<PathBuf>,
}

impl AgentFactory {
    pub fn new(config: Config) -> Self {
        let workspace_manager = Arc::new(WorkspaceManager::new(config.workspace_base.clone(), None));
        Self {
            config,
            workspace_manager,
            project_rules_dir: None,
        }
    }

    pub fn with_project_rules_dir(mut self, dir: PathBuf) -> Self {
        self.project_rules_dir = Some(dir);
        self
    }

    pub fn workspace_manager(&self) -> Arc<WorkspaceManager> {
        Arc::clone(&self.workspace_manager)
    }

    /// Scope directories: global `<home>/rules`, user
    /// `<home>/users/<user>/rules`, plus the project dir when set.
    fn rule_store_for(&self, user_id: &str) -> Arc<FileRuleStore> {
        Arc::new(FileRuleStore::new(
            Some(self.config.dataagent_home.join("rules")),
            Some(
                self.config
                    .dataagent_home
                    .join("users")
                    .join(sanitize_user_id(user_id))
                    .join("rules"),
            ),
            self.project_rules_dir.clone(),
        ))
    }

    pub fn build_middleware(
        &self,
        user_id: &str,
        agent_config: &AgentConfig,
    ) -> Vec<Arc<dyn Middleware>> {
        let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();
        if agent_config.enable_memory {
            chain.push(Arc::new(AgentMemoryMiddleware::new(Arc::new(
                AgentMemoryStore::new(self.config.agent_root.clone()),
            ))));
        }
        if agent_config.enable_skills {
            chain.push(Arc::new(SkillsMiddleware::new(
                self.config.agent_root.clone(),
            )));
        }
        if agent_config.enable_rules {
            chain.push(Arc::new(RulesMiddleware::new(
                self.rule_store_for(user_id),
                self.config.rules.max_content_size,
                agent_config.rules_debug_mode || self.config.rules.debug,
                None,
            )));
        }
        chain
    }

    /// Build an executor bound to one user: its file tracker resolves
    /// paths through the user's workspace sandbox.
    pub fn create_executor(
        &self,
        backend: Arc<dyn ModelBackend>,
        hitl_handler: Option<Arc<dyn ApprovalHandler>>,
        user_id: &str,
        agent_config: &AgentConfig,
    ) -> Result<AgentExecutor> {
        let sandbox = Arc::new(SandboxedFs::new(self.workspace_manager(), user_id, true)?);
        let file_tracker = Arc::new(FileOpTracker::new(Some(sandbox), self.config.diff_max_lines));
        Ok(AgentExecutor::new(
            backend,
            hitl_handler,
            agent_config.assistant_id.clone(),
            self.build_middleware(user_id, agent_config),
            file_tracker,
        ))
    }
}
