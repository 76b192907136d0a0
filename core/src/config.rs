//! Runtime configuration.
//!
//! Values are loaded from `$DATAAGENT_HOME/config.toml` (default
//! `~/.dataagent/config.toml`) when the file exists; every field has a
//! default so a missing or partial file is fine.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

pub const DATAAGENT_HOME_ENV: &str = "DATAAGENT_HOME";
const CONFIG_FILE: &str = "config.toml";

/// Fully resolved configuration used by the runtime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for all persistent state (`~/.dataagent` by default).
    pub dataagent_home: PathBuf,

    /// `<home>/agents/<agent_id>/` holds agent.md, skills/, rules/, mcp.json.
    pub agent_root: PathBuf,

    /// `<base>/<sanitized_user_id>/` is a user workspace.
    pub workspace_base: PathBuf,

    /// Live client connection cap for the session runtime.
    pub max_connections: usize,

    pub max_mcp_connections_per_user: usize,
    pub max_mcp_total_connections: usize,

    /// How long a suspended tool call waits for a human decision.
    pub hitl_timeout: Duration,

    /// Sessions idle longer than this are eligible for cleanup.
    pub session_ttl: Duration,

    /// Workspaces with an mtime older than this are swept.
    pub workspace_max_age_days: u64,

    pub rules: RulesConfig,

    /// Line cap for unified diffs attached to file_operation events.
    pub diff_max_lines: usize,
}

#[derive(Debug, Clone)]
pub struct RulesConfig {
    /// Byte budget for merged rule content injected into the prompt.
    pub max_content_size: usize,
    pub debug: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_content_size: 100_000,
            debug: false,
        }
    }
}

impl Config {
    /// Resolve the home directory and load `config.toml` if present.
    pub fn load(home_override: Option<PathBuf>) -> Result<Self> {
        let home = match home_override {
            Some(home) => home,
            None => find_dataagent_home(),
        };
        let config_path = home.join(CONFIG_FILE);
        let toml_cfg: ConfigToml = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            toml::from_str(&contents)?
        } else {
            ConfigToml::default()
        };
        Ok(Self::from_parts(home, toml_cfg))
    }

    fn from_parts(home: PathBuf, cfg: ConfigToml) -> Self {
        Self {
            agent_root: cfg.agent_root.unwrap_or_else(|| home.join("agents")),
            workspace_base: cfg
                .workspace_base
                .unwrap_or_else(|| home.join("workspaces")),
            max_connections: cfg.max_connections.unwrap_or(100),
            max_mcp_connections_per_user: cfg.max_mcp_connections_per_user.unwrap_or(10),
            max_mcp_total_connections: cfg.max_mcp_total_connections.unwrap_or(100),
            hitl_timeout: Duration::from_secs(cfg.hitl_timeout_secs.unwrap_or(300)),
            session_ttl: Duration::from_secs(cfg.session_ttl_secs.unwrap_or(24 * 60 * 60)),
            workspace_max_age_days: cfg.workspace_max_age_days.unwrap_or(30),
            rules: RulesConfig {
                max_content_size: cfg
                    .rules
                    .as_ref()
                    .and_then(|r| r.max_content_size)
                    .unwrap_or(100_000),
                debug: cfg.rules.as_ref().and_then(|r| r.debug).unwrap_or(false),
            },
            diff_max_lines: cfg.diff_max_lines.unwrap_or(200),
            dataagent_home: home,
        }
    }
}

/// Returns the value of `$DATAAGENT_HOME` if set, else `~/.dataagent`.
pub fn find_dataagent_home() -> PathBuf {
    if let Ok(home) = std::env::var(DATAAGENT_HOME_ENV) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    let mut home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.push(".dataagent");
    home
}

/// On-disk shape of `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigToml {
    agent_root: Option<PathBuf>,
    workspace_base: Option<PathBuf>,
    max_connections: Option<usize>,
    max_mcp_connections_per_user: Option<usize>,
    max_mcp_total_connections: Option<usize>,
    hitl_timeout_secs: Option<u64>,
    session_ttl_secs: Option<u64>,
    workspace_max_age_days: Option<u64>,
    rules: Option<RulesToml>,
    diff_max_lines: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RulesToml {
    max_content_size: Option<usize>,
    debug: Option<bool>,
}
