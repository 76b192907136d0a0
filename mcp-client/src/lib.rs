//! Minimal MCP client: JSON-RPC 2.0 over a child process's stdio.
//!
//! One request per line, one response per line. Requests are correlated
//! by id through a pending map so callers can issue them concurrently;
//! each request carries its own timeout. URL-based transports (SSE,
//! streamable HTTP) are provided by external adapters implementing
//! [`McpClient`].

mod stdio_client;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use stdio_client::StdioMcpClient;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, McpClientError>;

#[derive(Error, Debug)]
pub enum McpClientError {
    #[error("failed to spawn MCP server process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("MCP server closed the connection")]
    ConnectionClosed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("MCP server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tool descriptor as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
}

/// Result of `tools/call`, kept close to the wire shape.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Flatten text content blocks into a single string.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| {
                block
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self, timeout: Option<Duration>) -> Result<Vec<ToolInfo>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<ToolCallResult>;

    /// Tear the connection down. Safe to call more than once.
    async fn shutdown(&self);
}
