mod process_backend;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use clap::Subcommand;
use dataagent_core::Config;
use dataagent_core::DataAgentErr;
use dataagent_core::engine::AgentConfig;
use dataagent_core::engine::AgentFactory;
use dataagent_core::memory::AgentMemoryStore;
use dataagent_core::session::FileSessionStore;
use dataagent_core::session::MessageRole;
use dataagent_core::session::NewMessage;
use dataagent_core::session::SessionStore;
use dataagent_protocol::EventMsg;
use tracing::error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::process_backend::ProcessBackend;

/// Exit codes: 0 success, 1 partial failure, 2 hard failure.
const EXIT_SUCCESS: i32 = 0;
const EXIT_PARTIAL: i32 = 1;
const EXIT_HARD: i32 = 2;

#[derive(Parser)]
#[command(name = "dataagent", version, about = "Agent runtime control tool")]
struct Cli {
    /// Override the state root (default: $DATAAGENT_HOME or ~/.dataagent).
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one execution turn, printing events as JSON lines.
    Run {
        /// Provider command spawned per round (speaks stream chunks on
        /// stdio).
        #[arg(long, value_name = "COMMAND")]
        backend: String,

        /// Session to continue; a new one is created when omitted.
        #[arg(long, value_name = "SESSION_ID")]
        session: Option<String>,

        #[arg(long, default_value = "anonymous")]
        user: String,

        #[arg(long, value_name = "ASSISTANT_ID")]
        assistant: Option<String>,

        /// The user message.
        message: String,
    },

    /// List stored sessions.
    ListSessions {
        #[arg(long)]
        user: Option<String>,

        /// Include archived sessions.
        #[arg(long)]
        all: bool,
    },

    /// Reset an agent's persistent memory to the default, or to a copy
    /// of another agent's memory.
    ResetAgent {
        agent_id: String,

        /// Copy this agent's memory instead of the default.
        #[arg(long, value_name = "AGENT_ID")]
        from: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            EXIT_HARD
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = Config::load(cli.home)?;
    match cli.command {
        Command::Run {
            backend,
            session,
            user,
            assistant,
            message,
        } => run_turn(&config, &backend, session, &user, assistant, &message).await,
        Command::ListSessions { user, all } => list_sessions(&config, user.as_deref(), all).await,
        Command::ResetAgent { agent_id, from } => reset_agent(&config, &agent_id, from.as_deref()),
    }
}

async fn run_turn(
    config: &Config,
    backend_command: &str,
    session: Option<String>,
    user: &str,
    assistant: Option<String>,
    message: &str,
) -> anyhow::Result<i32> {
    let backend = Arc::new(ProcessBackend::from_command_line(backend_command)?);
    let store = FileSessionStore::new(config.dataagent_home.join("sessions"));
    let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());

    store
        .ensure_session(&session_id, user, assistant.as_deref(), false)
        .await?;
    store
        .append_message(&session_id, NewMessage::text(MessageRole::User, message))
        .await?;

    // The factory wires the memory/skills/rules middleware chain and the
    // user's workspace sandbox. No approval handler attached: tool calls
    // auto-approve.
    let mut factory = AgentFactory::new(config.clone());
    if let Ok(cwd) = std::env::current_dir() {
        factory = factory.with_project_rules_dir(cwd.join(".dataagent").join("rules"));
    }
    let executor = factory.create_executor(
        backend,
        None,
        user,
        &AgentConfig {
            assistant_id: assistant,
            ..Default::default()
        },
    )?;
    let rx_event = executor.execute(message, &session_id, None);

    let mut assistant_text = String::new();
    let mut exit_code = EXIT_SUCCESS;
    while let Ok(event) = rx_event.recv().await {
        println!("{}", event.encode());
        match &event.msg {
            EventMsg::Text(text) if !text.is_final => assistant_text.push_str(&text.content),
            EventMsg::Error(_) => exit_code = EXIT_PARTIAL,
            EventMsg::Done(done) if done.cancelled => exit_code = EXIT_PARTIAL,
            _ => {}
        }
    }

    if !assistant_text.is_empty() {
        store
            .append_message(
                &session_id,
                NewMessage::text(MessageRole::Assistant, assistant_text),
            )
            .await?;
    }
    Ok(exit_code)
}

async fn list_sessions(
    config: &Config,
    user: Option<&str>,
    include_archived: bool,
) -> anyhow::Result<i32> {
    let store = FileSessionStore::new(config.dataagent_home.join("sessions"));
    for record in store.list_sessions(user, include_archived).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(EXIT_SUCCESS)
}

fn reset_agent(config: &Config, agent_id: &str, from: Option<&str>) -> anyhow::Result<i32> {
    let store = AgentMemoryStore::new(config.agent_root.clone());
    match store.reset(agent_id, from) {
        Ok(()) => {
            println!("reset memory for agent {agent_id}");
            Ok(EXIT_SUCCESS)
        }
        Err(DataAgentErr::AgentNotFound(missing)) => {
            eprintln!("error: no agent with id: {missing}");
            Ok(EXIT_PARTIAL)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_backend_and_message() {
        let cli = Cli::parse_from([
            "dataagent",
            "run",
            "--backend",
            "provider --model small",
            "--user",
            "alice",
            "hello there",
        ]);
        match cli.command {
            Command::Run {
                backend,
                user,
                message,
                session,
                ..
            } => {
                assert_eq!(backend, "provider --model small");
                assert_eq!(user, "alice");
                assert_eq!(message, "hello there");
                assert!(session.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_reset_agent_with_source() {
        let cli = Cli::parse_from(["dataagent", "reset-agent", "helper", "--from", "mentor"]);
        match cli.command {
            Command::ResetAgent { agent_id, from } => {
                assert_eq!(agent_id, "helper");
                assert_eq!(from.as_deref(), Some("mentor"));
            }
            _ => panic!("expected reset-agent"),
        }
    }
}
