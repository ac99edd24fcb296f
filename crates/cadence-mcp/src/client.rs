//! Stdio tool-server client: spawns the server as a subprocess and exchanges
//! newline-delimited JSON-RPC 2.0 messages over its stdin/stdout.

use crate::protocol::*;
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Something that can list and call tools on a server.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> CadenceResult<Vec<McpToolDef>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> CadenceResult<McpToolResult>;

    async fn close(&self) -> CadenceResult<()> {
        Ok(())
    }
}

/// How to launch a stdio tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioServerConfig {
    /// Display name; defaults to the command.
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Only these tools are exposed when set.
    #[serde(default)]
    pub tool_filter: Option<Vec<String>>,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl StdioServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: None,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            request_timeout_secs: default_request_timeout_secs(),
            tool_filter: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.command)
    }
}

fn transport_error(server: &str, message: impl Into<String>) -> CadenceError {
    CadenceError::tool(server, message)
}

/// Client for one running stdio tool server.
pub struct McpClient {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    server_name: String,
    timeout: Duration,
}

impl McpClient {
    /// Spawns the server and performs the initialization handshake.
    pub async fn connect(config: &StdioServerConfig) -> CadenceResult<Self> {
        let server_name = config.display_name().to_string();
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            transport_error(
                &server_name,
                format!("Failed to spawn '{}': {e}", config.command),
            )
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| transport_error(&server_name, "stdin not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| transport_error(&server_name, "stdout not available"))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = pending.clone();
        let reader_name = server_name.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(server = %reader_name, "Tool server stdout closed");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(resp) => {
                                // Server notifications carry no id.
                                if let Some(id) = resp.id {
                                    if let Some(tx) = reader_pending.lock().await.remove(&id) {
                                        let _ = tx.send(resp);
                                    }
                                }
                            }
                            Err(e) => {
                                debug!(server = %reader_name, line = %trimmed, error = %e, "Non-JSON-RPC line from tool server");
                            }
                        }
                    }
                    Err(e) => {
                        error!(server = %reader_name, error = %e, "Error reading tool server stdout");
                        break;
                    }
                }
            }
            // Fail whatever is still waiting.
            reader_pending.lock().await.clear();
        });

        let client = Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            server_name,
            timeout: Duration::from_secs(config.request_timeout_secs),
        };

        let init = client.initialize().await?;
        info!(
            server = %client.server_name,
            version = %init.protocol_version,
            remote = init.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
            "Tool server initialized"
        );
        client.notify("notifications/initialized", None).await?;
        Ok(client)
    }

    async fn write_line(&self, line: String) -> CadenceResult<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> CadenceResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_line(serde_json::to_string(&req)?).await {
            self.pending.lock().await.remove(&id);
            return Err(transport_error(
                &self.server_name,
                format!("Failed to write '{method}': {e}"),
            ));
        }

        let resp = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(transport_error(
                    &self.server_name,
                    format!("Connection closed during '{method}'"),
                ))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(transport_error(
                    &self.server_name,
                    format!("Request '{method}' timed out"),
                ));
            }
        };

        if let Some(err) = resp.error {
            return Err(transport_error(
                &self.server_name,
                format!("JSON-RPC error {}: {}", err.code, err.message),
            ));
        }
        resp.result.ok_or_else(|| {
            transport_error(&self.server_name, format!("Empty '{method}' result"))
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> CadenceResult<()> {
        let note = JsonRpcNotification::new(method, params);
        self.write_line(serde_json::to_string(&note)?).await
    }

    async fn initialize(&self) -> CadenceResult<InitializeResult> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "cadence",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self.request("initialize", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait]
impl ToolProvider for McpClient {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn list_tools(&self) -> CadenceResult<Vec<McpToolDef>> {
        let result = self.request("tools/list", None).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
        Ok(serde_json::from_value(tools)?)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> CadenceResult<McpToolResult> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self.request("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn close(&self) -> CadenceResult<()> {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(server = %self.server_name, error = %e, "Tool server already exited");
        }
        Ok(())
    }
}
