//! MCP server configuration and its persisted `mcpServers` representation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DataAgentErr;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Sse,
    StreamableHttp,
}

/// One server entry, shaped exactly like the persisted JSON:
/// `{command?, args?, env?, url?, transport?, headers?, disabled?,
/// autoApprove?}`. The server name is the enclosing map key.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct McpServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<McpTransport>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(rename = "autoApprove", default, skip_serializing_if = "Vec::is_empty")]
    pub auto_approve: Vec<String>,
}

/// Parameters handed to a client factory, derived from the config.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionParams {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Url {
        url: String,
        transport: McpTransport,
        /// Omitted entirely when no headers are configured.
        headers: Option<BTreeMap<String, String>>,
    },
}

impl McpServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Default::default()
        }
    }

    /// Derive client connection parameters. A config must be either
    /// command-based or URL-based.
    pub fn connection_params(&self, name: &str) -> Result<ConnectionParams> {
        match (&self.command, &self.url) {
            (Some(command), None) => Ok(ConnectionParams::Stdio {
                command: command.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
            }),
            (None, Some(url)) => Ok(ConnectionParams::Url {
                url: url.clone(),
                transport: self.transport.unwrap_or(McpTransport::StreamableHttp),
                headers: if self.headers.is_empty() {
                    None
                } else {
                    Some(self.headers.clone())
                },
            }),
            (Some(_), Some(_)) => Err(DataAgentErr::InvalidMcpConfig {
                name: name.to_string(),
                reason: "config has both command and url".to_string(),
            }),
            (None, None) => Err(DataAgentErr::InvalidMcpConfig {
                name: name.to_string(),
                reason: "config has neither command nor url".to_string(),
            }),
        }
    }
}

/// A user's full MCP configuration: server name to server entry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl McpConfig {
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &McpServerConfig)> {
        self.servers.iter().filter(|(_, cfg)| !cfg.disabled)
    }

    pub fn add_server(&mut self, name: impl Into<String>, server: McpServerConfig) {
        self.servers.insert(name.into(), server);
    }

    pub fn remove_server(&mut self, name: &str) -> bool {
        self.servers.remove(name).is_some()
    }

    pub fn get_server(&self, name: &str) -> Option<&McpServerConfig> {
        self.servers.get(name)
    }

    /// Read an `mcp.json` file. A missing file is an empty config.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
