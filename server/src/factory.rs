//! The production executor factory: binds the core agent factory (which
//! owns the middleware chain and workspace sandboxing) to a model
//! backend, building one executor per session.

use std::sync::Arc;

use async_trait::async_trait;
use dataagent_core::engine::AgentConfig;
use dataagent_core::engine::AgentExecutor;
use dataagent_core::engine::AgentFactory;
use dataagent_core::engine::ModelBackend;
use dataagent_core::hitl::ApprovalHandler;

use crate::handler::ExecutorFactory;

pub struct AgentExecutorFactory {
    factory: Arc<AgentFactory>,
    backend: Arc<dyn ModelBackend>,
}

impl AgentExecutorFactory {
    pub fn new(factory: Arc<AgentFactory>, backend: Arc<dyn ModelBackend>) -> Self {
        Self { factory, backend }
    }
}

#[async_trait]
impl ExecutorFactory for AgentExecutorFactory {
    async fn create_executor(
        &self,
        session_id: &str,
        user_id: &str,
        hitl_handler: Arc<dyn ApprovalHandler>,
    ) -> dataagent_core::Result<AgentExecutor> {
        let assistant_id = format!(
            "server-{}",
            session_id.chars().take(8).collect::<String>()
        );
        let agent_config = AgentConfig {
            assistant_id: Some(assistant_id),
            ..Default::default()
        };
        self.factory.create_executor(
            Arc::clone(&self.backend),
            Some(hitl_handler),
            user_id,
            &agent_config,
        )
    }
}
