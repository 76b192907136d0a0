//! Storage for per-user MCP configurations.
//!
//! Keyed by `(user_id, server_name)`; only the owning user (or an admin)
//! may mutate an entry, which is enforced at the access layer. The
//! on-disk fallback is the per-agent `mcp.json` handled by
//! [`McpConfig::load_file`](crate::mcp::McpConfig::load_file).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::mcp::config::McpConfig;
use crate::mcp::config::McpServerConfig;

#[async_trait]
pub trait McpConfigStore: Send + Sync {
    /// An absent user yields an empty config, never an error.
    async fn get_user_config(&self, user_id: &str) -> Result<McpConfig>;

    async fn save_user_config(&self, user_id: &str, config: &McpConfig) -> Result<()>;

    async fn delete_user_config(&self, user_id: &str) -> Result<bool>;

    async fn add_server(&self, user_id: &str, name: &str, server: McpServerConfig) -> Result<()>;

    async fn remove_server(&self, user_id: &str, name: &str) -> Result<bool>;

    async fn get_server(&self, user_id: &str, name: &str) -> Result<Option<McpServerConfig>>;
}

/// In-memory store; SQL backends plug in behind the same trait.
#[derive(Default)]
pub struct MemoryMcpConfigStore {
    configs: Mutex<HashMap<String, McpConfig>>,
}

impl MemoryMcpConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl McpConfigStore for MemoryMcpConfigStore {
    async fn get_user_config(&self, user_id: &str) -> Result<McpConfig> {
        Ok(self
            .configs
            .lock()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_user_config(&self, user_id: &str, config: &McpConfig) -> Result<()> {
        self.configs
            .lock()
            .await
            .insert(user_id.to_string(), config.clone());
        Ok(())
    }

    async fn delete_user_config(&self, user_id: &str) -> Result<bool> {
        Ok(self.configs.lock().await.remove(user_id).is_some())
    }

    async fn add_server(&self, user_id: &str, name: &str, server: McpServerConfig) -> Result<()> {
        let mut configs = self.configs.lock().await;
        configs
            .entry(user_id.to_string())
            .or_default()
            .add_server(name, server);
        Ok(())
    }

    async fn remove_server(&self, user_id: &str, name: &str) -> Result<bool> {
        let mut configs = self.configs.lock().await;
        let Some(config) = configs.get_mut(user_id) else {
            return Ok(false);
        };
        Ok(config.remove_server(name))
    }

    async fn get_server(&self, user_id: &str, name: &str) -> Result<Option<McpServerConfig>> {
        let configs = self.configs.lock().await;
        Ok(configs
            .get(user_id)
            .and_then(|c| c.get_server(name))
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn absent_user_yields_empty_config() {
        let store = MemoryMcpConfigStore::new();
        let config = store.get_user_config("nobody").await.unwrap();
        assert!(config.servers.is_empty());
    }

    #[tokio::test]
    async fn add_get_remove_server() {
        let store = MemoryMcpConfigStore::new();
        store
            .add_server("alice", "files", McpServerConfig::stdio("mcp-files", vec![]))
            .await
            .unwrap();

        let server = store.get_server("alice", "files").await.unwrap();
        assert!(server.is_some());
        assert!(store.get_server("bob", "files").await.unwrap().is_none());

        assert!(store.remove_server("alice", "files").await.unwrap());
        assert!(!store.remove_server("alice", "files").await.unwrap());
    }

    #[tokio::test]
    async fn configs_are_isolated_per_user() {
        let store = MemoryMcpConfigStore::new();
        store
            .add_server("alice", "a", McpServerConfig::stdio("a-bin", vec![]))
            .await
            .unwrap();
        store
            .add_server("bob", "b", McpServerConfig::stdio("b-bin", vec![]))
            .await
            .unwrap();

        let alice = store.get_user_config("alice").await.unwrap();
        assert_eq!(alice.servers.len(), 1);
        assert!(alice.get_server("b").is_none());

        assert!(store.delete_user_config("alice").await.unwrap());
        let bob = store.get_user_config("bob").await.unwrap();
        assert_eq!(bob.servers.len(), 1);
    }
}
