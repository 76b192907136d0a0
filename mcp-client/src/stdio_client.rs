//! JSON-RPC 2.0 client over a spawned child process.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use crate::DEFAULT_REQUEST_TIMEOUT;
use crate::McpClient;
use crate::McpClientError;
use crate::Result;
use crate::ToolCallResult;
use crate::ToolInfo;

const JSONRPC_VERSION: &str = "2.0";
const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: i64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: Option<i64>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<serde_json::Value>>>>>;

/// MCP client speaking JSON-RPC over a child process's stdin/stdout.
pub struct StdioMcpClient {
    child: Mutex<Option<Child>>,
    stdin: Mutex<tokio::process::ChildStdin>,
    pending: PendingMap,
    next_id: AtomicI64,
}

impl StdioMcpClient {
    /// Spawn the server process and run the `initialize` handshake.
    pub async fn new(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(McpClientError::Spawn)?;

        let stdin = child.stdin.take().ok_or(McpClientError::ConnectionClosed)?;
        let stdout = child.stdout.take().ok_or(McpClientError::ConnectionClosed)?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(read_loop(stdout, Arc::clone(&pending)));

        let client = Self {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicI64::new(1),
        };
        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "dataagent",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        self.request("initialize", Some(params), DEFAULT_REQUEST_TIMEOUT)
            .await?;
        self.notify("notifications/initialized").await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        if let Err(e) = self.stdin.lock().await.write_all(line.as_bytes()).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpClientError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpClientError::Timeout(timeout))
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION,
            method,
        };
        let mut line = serde_json::to_string(&notification)?;
        line.push('\n');
        self.stdin.lock().await.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

async fn read_loop(stdout: tokio::process::ChildStdout, pending: PendingMap) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response: JsonRpcResponse = match serde_json::from_str(line) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("ignoring non-response line from MCP server: {e}");
                        continue;
                    }
                };
                let Some(id) = response.id else {
                    continue;
                };
                let Some(tx) = pending.lock().await.remove(&id) else {
                    warn!("MCP response for unknown request id {id}");
                    continue;
                };
                let outcome = match response.error {
                    Some(err) => Err(McpClientError::Rpc {
                        code: err.code,
                        message: err.message,
                    }),
                    None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
                };
                tx.send(outcome).ok();
            }
            Ok(None) | Err(_) => break,
        }
    }
    // Stream closed: fail every waiter so callers do not hang.
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        tx.send(Err(McpClientError::ConnectionClosed)).ok();
    }
}

#[async_trait]
impl McpClient for StdioMcpClient {
    async fn list_tools(&self, timeout: Option<Duration>) -> Result<Vec<ToolInfo>> {
        let result = self
            .request(
                "tools/list",
                None,
                timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            )
            .await?;
        #[derive(Deserialize)]
        struct ListToolsResult {
            #[serde(default)]
            tools: Vec<ToolInfo>,
        }
        let parsed: ListToolsResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<ToolCallResult> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let result = self
            .request(
                "tools/call",
                Some(params),
                timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("failed to kill MCP server process: {e}");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A tiny MCP server written in shell: answers initialize, tools/list
    /// and tools/call with canned JSON-RPC responses.
    #[cfg(unix)]
    fn fake_server_script() -> String {
        r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *initialize*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26"}}\n' "$id" ;;
    *tools/list*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echo args","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *tools/call*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"ok"}],"isError":false}}\n' "$id" ;;
  esac
done
"#
        .to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_list_and_call_against_fake_server() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("server.sh");
        std::fs::write(&script, fake_server_script()).unwrap();

        let client = StdioMcpClient::new(
            "sh",
            &[script.display().to_string()],
            &HashMap::new(),
        )
        .await
        .unwrap();

        let tools = client.list_tools(None).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = client
            .call_tool("echo", Some(json!({"value": 1})), None)
            .await
            .unwrap();
        assert_eq!(result.text(), "ok");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = StdioMcpClient::new("definitely-not-a-real-binary", &[], &HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpClientError::Spawn(_)));
    }
}
