//! Model backend that delegates to an external provider process.
//!
//! The provider is spawned per round, receives one JSON request line on
//! stdin (`{input, system_prompt, session_id, assistant_id}`) and
//! answers with one serialized `StreamChunk` per stdout line until it
//! exits. This keeps the concrete LLM SDK outside the core, behind a
//! process boundary, while the middleware-augmented system prompt still
//! reaches the provider.

use std::process::Stdio;

use async_trait::async_trait;
use dataagent_core::DataAgentErr;
use dataagent_core::engine::ChunkStream;
use dataagent_core::engine::ModelBackend;
use dataagent_core::engine::RunConfig;
use dataagent_core::engine::StreamChunk;
use dataagent_core::engine::StreamInput;
use dataagent_core::middleware::ModelRequest;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;

pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
}

impl ProcessBackend {
    /// `command` is split on whitespace: program first, then args.
    pub fn from_command_line(command: &str) -> anyhow::Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("backend command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl ModelBackend for ProcessBackend {
    async fn stream(
        &self,
        input: StreamInput,
        request: &ModelRequest,
        config: &RunConfig,
    ) -> dataagent_core::Result<ChunkStream> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DataAgentErr::Backend(format!("failed to spawn backend: {e}")))?;

        let request = json!({
            "input": input,
            "system_prompt": request.system_prompt,
            "session_id": config.session_id,
            "assistant_id": config.assistant_id,
        });
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DataAgentErr::Backend("backend stdin not captured".to_string()))?;
        let mut line = request.to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DataAgentErr::Backend(format!("failed to write request: {e}")))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DataAgentErr::Backend("backend stdout not captured".to_string()))?;
        let lines = BufReader::new(stdout).lines();

        Ok(Box::pin(futures::stream::unfold(
            (lines, child),
            |(mut lines, child)| async move {
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let parsed = serde_json::from_str::<StreamChunk>(&line)
                                .map_err(|e| {
                                    DataAgentErr::Backend(format!("bad chunk from backend: {e}"))
                                });
                            return Some((parsed, (lines, child)));
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            return Some((
                                Err(DataAgentErr::Backend(format!("backend read error: {e}"))),
                                (lines, child),
                            ));
                        }
                    }
                }
            },
        )))
    }
}
