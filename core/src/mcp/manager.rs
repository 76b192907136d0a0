//! Per-user pools of MCP server connections.
//!
//! One manager serves every user in the process. The per-user maps never
//! mix users: `get_tools(u)` only ever sees `u`'s own connections, and
//! operations on one user cannot mutate another user's entry. A single
//! async lock guards the connection maps and the global counter; it is
//! held across the connect attempts of one call and released before the
//! result is returned to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dataagent_mcp_client::McpClient;
use dataagent_mcp_client::StdioMcpClient;
use dataagent_mcp_client::ToolCallResult;
use dataagent_mcp_client::ToolInfo;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

use crate::error::DataAgentErr;
use crate::error::Result;
use crate::mcp::config::ConnectionParams;
use crate::mcp::config::McpConfig;
use crate::mcp::config::McpServerConfig;

/// Timeout for the initial `tools/list` after a client connects.
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a client for derived connection parameters. Injected so tests
/// and alternative transports can supply their own clients.
#[async_trait]
pub trait McpClientFactory: Send + Sync {
    async fn connect(&self, name: &str, params: &ConnectionParams)
    -> anyhow::Result<Arc<dyn McpClient>>;
}

/// Spawns [`StdioMcpClient`]s for command-based servers. URL-based
/// servers need an adapter for their transport.
pub struct StdioClientFactory;

#[async_trait]
impl McpClientFactory for StdioClientFactory {
    async fn connect(
        &self,
        name: &str,
        params: &ConnectionParams,
    ) -> anyhow::Result<Arc<dyn McpClient>> {
        match params {
            ConnectionParams::Stdio { command, args, env } => {
                let env: HashMap<String, String> =
                    env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let client = StdioMcpClient::new(command, args, &env).await?;
                Ok(Arc::new(client))
            }
            ConnectionParams::Url { transport, .. } => Err(anyhow::anyhow!(
                "no client adapter for {transport:?} transport (server '{name}')"
            )),
        }
    }
}

/// Runtime handle for one server connection.
pub struct McpConnection {
    pub config: McpServerConfig,
    pub client: Option<Arc<dyn McpClient>>,
    pub tools: Vec<ToolInfo>,
    pub connected: bool,
    pub error: Option<String>,
}

/// Status summary exposed to callers and the REST layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub tools_count: usize,
    pub error: Option<String>,
}

#[derive(Default)]
struct ManagerState {
    /// `user_id -> server_name -> connection`
    connections: HashMap<String, HashMap<String, McpConnection>>,
    total_connections: usize,
}

pub struct McpConnectionManager {
    max_connections_per_user: usize,
    max_total_connections: usize,
    factory: Arc<dyn McpClientFactory>,
    state: Mutex<ManagerState>,
}

impl McpConnectionManager {
    pub fn new(
        max_connections_per_user: usize,
        max_total_connections: usize,
        factory: Arc<dyn McpClientFactory>,
    ) -> Self {
        Self {
            max_connections_per_user,
            max_total_connections,
            factory,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Connect every enabled server in `config` that is not already
    /// connected for this user. Failures are recorded on the connection
    /// and never propagate; cap exhaustion stops further attempts.
    pub async fn connect(
        &self,
        user_id: &str,
        config: &McpConfig,
    ) -> HashMap<String, ConnectionStatus> {
        let mut state = self.state.lock().await;
        let ManagerState {
            connections,
            total_connections,
        } = &mut *state;
        let user_connections = connections.entry(user_id.to_string()).or_default();

        for (name, server_config) in config.enabled_servers() {
            if user_connections
                .get(name)
                .is_some_and(|conn| conn.connected)
            {
                continue;
            }
            if user_connections.len() >= self.max_connections_per_user {
                warn!(
                    "user {user_id} reached max MCP connections ({})",
                    self.max_connections_per_user
                );
                break;
            }
            if *total_connections >= self.max_total_connections {
                warn!(
                    "total MCP connections limit reached ({})",
                    self.max_total_connections
                );
                break;
            }

            let connection = self.create_connection(name, server_config).await;
            if connection.connected {
                *total_connections += 1;
            }
            user_connections.insert(name.clone(), connection);
        }

        user_connections
            .iter()
            .map(|(name, conn)| (name.clone(), status_of(conn)))
            .collect()
    }

    async fn create_connection(&self, name: &str, config: &McpServerConfig) -> McpConnection {
        let mut connection = McpConnection {
            config: config.clone(),
            client: None,
            tools: Vec::new(),
            connected: false,
            error: None,
        };

        let params = match config.connection_params(name) {
            Ok(params) => params,
            Err(e) => {
                warn!("invalid MCP server config '{name}': {e}");
                connection.error = Some(e.to_string());
                return connection;
            }
        };

        match self.factory.connect(name, &params).await {
            Ok(client) => match client.list_tools(Some(LIST_TOOLS_TIMEOUT)).await {
                Ok(tools) => {
                    info!("connected to MCP server '{name}' with {} tools", tools.len());
                    connection.tools = tools;
                    connection.client = Some(client);
                    connection.connected = true;
                }
                Err(e) => {
                    warn!("failed to list tools for MCP server '{name}': {e}");
                    client.shutdown().await;
                    connection.error = Some(e.to_string());
                }
            },
            Err(e) => {
                warn!("failed to connect to MCP server '{name}': {e:#}");
                connection.error = Some(format!("{e:#}"));
            }
        }

        connection
    }

    /// Disconnect one server, or every server when `server_name` is
    /// `None`. Safe to call when nothing is mapped.
    pub async fn disconnect(&self, user_id: &str, server_name: Option<&str>) {
        let mut state = self.state.lock().await;
        let ManagerState {
            connections,
            total_connections,
        } = &mut *state;
        let Some(user_connections) = connections.get_mut(user_id) else {
            return;
        };

        let targets: Vec<String> = match server_name {
            Some(name) if user_connections.contains_key(name) => vec![name.to_string()],
            Some(_) => Vec::new(),
            None => user_connections.keys().cloned().collect(),
        };

        for name in targets {
            if let Some(connection) = user_connections.remove(&name) {
                if let Some(client) = connection.client {
                    client.shutdown().await;
                    info!("disconnected MCP server '{name}' for user {user_id}");
                }
                if connection.connected {
                    *total_connections -= 1;
                }
            }
        }

        if user_connections.is_empty() {
            connections.remove(user_id);
        }
    }

    pub async fn disconnect_all(&self) {
        let users: Vec<String> = {
            let state = self.state.lock().await;
            state.connections.keys().cloned().collect()
        };
        for user in users {
            self.disconnect(&user, None).await;
        }
    }

    /// Tool descriptors from this user's connected servers only.
    pub async fn get_tools(&self, user_id: &str) -> Vec<ToolInfo> {
        let state = self.state.lock().await;
        let Some(user_connections) = state.connections.get(user_id) else {
            return Vec::new();
        };
        user_connections
            .values()
            .filter(|conn| conn.connected)
            .flat_map(|conn| conn.tools.iter().cloned())
            .collect()
    }

    /// Invoke a tool on one of the user's connected servers.
    pub async fn call_tool(
        &self,
        user_id: &str,
        server_name: &str,
        tool: &str,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<ToolCallResult> {
        let client = {
            let state = self.state.lock().await;
            state
                .connections
                .get(user_id)
                .and_then(|conns| conns.get(server_name))
                .and_then(|conn| conn.client.clone())
        };
        let Some(client) = client else {
            return Err(DataAgentErr::Backend(format!(
                "no connected MCP server '{server_name}' for user {user_id}"
            )));
        };
        client
            .call_tool(tool, arguments, timeout)
            .await
            .map_err(|e| DataAgentErr::Backend(e.to_string()))
    }

    pub async fn get_connection_status(&self, user_id: &str) -> HashMap<String, ConnectionStatus> {
        let state = self.state.lock().await;
        state
            .connections
            .get(user_id)
            .map(|conns| {
                conns
                    .iter()
                    .map(|(name, conn)| (name.clone(), status_of(conn)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `connected AND client present`. Not a deep probe.
    pub async fn health_check(&self, user_id: &str) -> HashMap<String, bool> {
        let state = self.state.lock().await;
        state
            .connections
            .get(user_id)
            .map(|conns| {
                conns
                    .iter()
                    .map(|(name, conn)| {
                        (name.clone(), conn.connected && conn.client.is_some())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn total_connections(&self) -> usize {
        self.state.lock().await.total_connections
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }
}

fn status_of(conn: &McpConnection) -> ConnectionStatus {
    ConnectionStatus {
        connected: conn.connected,
        tools_count: conn.tools.len(),
        error: conn.error.clone(),
    }
}
