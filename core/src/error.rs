use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, DataAgentErr>;

/// Violations raised by the workspace sandbox. These are never swallowed:
/// they surface as protocol errors (`INVALID_MESSAGE`) or REST 403/413.
#[derive(Error, Debug)]
pub enum WorkspaceErr {
    /// The resolved target is not a descendant of the workspace root.
    #[error("path '{0}' escapes the workspace sandbox")]
    PathEscape(String),

    /// A write would push the workspace past its quota.
    #[error("workspace quota exceeded for user {user}: {detail}")]
    QuotaExceeded { user: String, detail: String },
}

#[derive(Error, Debug)]
pub enum DataAgentErr {
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceErr),

    /// A rule file that cannot be parsed. A single bad file never blocks a
    /// store reload; it is logged and the rule is omitted.
    #[error("failed to parse rule: {0}")]
    RuleParse(String),

    #[error("no directory configured for scope: {0}")]
    ScopeNotConfigured(String),

    #[error("invalid MCP server config for '{name}': {reason}")]
    InvalidMcpConfig { name: String, reason: String },

    #[error("no session with id: {0}")]
    SessionNotFound(String),

    #[error("user '{requester}' is not authorized to access resources of '{target}'")]
    Unauthorized { requester: String, target: String },

    #[error("no agent with id: {0}")]
    AgentNotFound(String),

    /// The current task was cancelled out from under the executor.
    #[error("interrupted")]
    Interrupted,

    /// Agent loop died unexpectedly.
    #[error("internal error; agent loop died unexpectedly")]
    InternalAgentDied,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("checksum mismatch for applied migration {0}")]
    MigrationChecksum(String),

    #[error("migration {0} does not support rollback")]
    RollbackUnsupported(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("model backend error: {0}")]
    Backend(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl DataAgentErr {
    /// Whether the session may keep accepting input after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DataAgentErr::Workspace(_)
                | DataAgentErr::RuleParse(_)
                | DataAgentErr::ScopeNotConfigured(_)
                | DataAgentErr::InvalidMcpConfig { .. }
                | DataAgentErr::SessionNotFound(_)
        )
    }
}
