#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, StateMap};
use cadence_mcp::*;
use cadence_tools::{ToolContext, ToolFilter, Toolset};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

struct FakeProvider {
    fail_listing: bool,
    closed: Arc<AtomicU32>,
}

#[async_trait]
impl ToolProvider for FakeProvider {
    fn server_name(&self) -> &str {
        "fake"
    }

    async fn list_tools(&self) -> CadenceResult<Vec<McpToolDef>> {
        if self.fail_listing {
            return Err(CadenceError::tool("fake", "tools/list timed out"));
        }
        Ok(vec![
            McpToolDef {
                name: "read_file".into(),
                description: "Read a file".into(),
                input_schema: json!({"type": "object"}),
            },
            McpToolDef {
                name: "write_file".into(),
                description: "Write a file".into(),
                input_schema: json!({"type": "object"}),
            },
            McpToolDef {
                name: "fail".into(),
                description: "Always fails".into(),
                input_schema: json!({"type": "object"}),
            },
        ])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> CadenceResult<McpToolResult> {
        let is_error = name == "fail";
        Ok(McpToolResult {
            content: vec![McpContent::text(format!("{name}:{arguments}"))],
            is_error,
        })
    }

    async fn close(&self) -> CadenceResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector scripted per attempt: `Err` fails to connect, `Ok(true)` connects
/// to a server whose listing fails, `Ok(false)` connects to a healthy server.
struct ScriptedConnector {
    script: Vec<Result<bool, ()>>,
    connects: AtomicU32,
    closed: Arc<AtomicU32>,
}

impl ScriptedConnector {
    fn new(script: Vec<Result<bool, ()>>) -> Self {
        Self {
            script,
            connects: AtomicU32::new(0),
            closed: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl McpConnector for ScriptedConnector {
    async fn connect(&self) -> CadenceResult<Arc<dyn ToolProvider>> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) as usize;
        match self.script.get(n).copied().unwrap_or(Err(())) {
            Err(()) => Err(CadenceError::tool("fake", "connection refused")),
            Ok(fail_listing) => Ok(Arc::new(FakeProvider {
                fail_listing,
                closed: self.closed.clone(),
            })),
        }
    }
}

fn ctx() -> ToolContext {
    ToolContext::new("inv", "agent", "c1", StateMap::new())
}

// ---------------------------------------------------------------------------
// 1. Discovery retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discovery_recovers_on_third_attempt_and_reconnects() {
    let connector = Arc::new(ScriptedConnector::new(vec![Err(()), Ok(true), Ok(false)]));
    let toolset = McpToolset::new("files", connector.clone());

    let tools = toolset.tools().await.unwrap();
    assert_eq!(tools.len(), 3);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    // The connection whose listing failed was dropped and closed.
    assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn discovery_exhaustion_raises_tool_loading() {
    let connector = Arc::new(ScriptedConnector::new(vec![Err(()), Err(()), Err(())]));
    let toolset = McpToolset::new("files", connector.clone());

    let err = toolset.tools().await.err().unwrap();
    assert!(matches!(err, CadenceError::ToolLoading { attempts: 3, .. }));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cached_connection_reused() {
    let connector = Arc::new(ScriptedConnector::new(vec![Ok(false)]));
    let toolset = McpToolset::new("files", connector.clone());
    toolset.tools().await.unwrap();
    toolset.tools().await.unwrap();
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

    toolset.close().await.unwrap();
    assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// 2. Filtering and invocation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn filter_preserves_server_order() {
    let connector = Arc::new(ScriptedConnector::new(vec![Ok(false)]));
    let toolset = McpToolset::new("files", connector)
        .with_filter(ToolFilter::allow(["write_file", "read_file"]));
    let names: Vec<_> = toolset
        .tools()
        .await
        .unwrap()
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    assert_eq!(names, vec!["read_file", "write_file"]);
}

#[tokio::test]
async fn remote_error_result_is_tool_execution() {
    let connector = Arc::new(ScriptedConnector::new(vec![Ok(false)]));
    let toolset = McpToolset::new("files", connector);
    let tools = toolset.tools().await.unwrap();

    let read = tools.iter().find(|t| t.name() == "read_file").unwrap();
    let mut args = Map::new();
    args.insert("path".into(), json!("/tmp/a"));
    let out = read.invoke(args, &mut ctx()).await.unwrap();
    assert_eq!(out["content"][0]["text"], json!(r#"read_file:{"path":"/tmp/a"}"#));

    let fail = tools.iter().find(|t| t.name() == "fail").unwrap();
    let err = fail.invoke(Map::new(), &mut ctx()).await.unwrap_err();
    assert!(matches!(err, CadenceError::ToolExecution { .. }));
    assert!(err.is_plugin_interceptable());
}

// ---------------------------------------------------------------------------
// 3. Real stdio server
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[tokio::test]
async fn stdio_server_roundtrip() {
    let script = r#"
read line; echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"sh-server"}}}'
read line
read line; echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"ping","description":"Ping"},{"name":"hidden"}]}}'
read line; echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}]}}'
"#;
    let mut config = StdioServerConfig::new("sh");
    config.args = vec!["-c".into(), script.into()];
    config.tool_filter = Some(vec!["ping".into()]);

    let toolset = McpToolset::stdio(config);
    let tools = toolset.tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].declaration().description, "Ping");

    let out = tools[0].invoke(Map::new(), &mut ctx()).await.unwrap();
    assert_eq!(out["content"][0]["text"], json!("pong"));
    toolset.close().await.unwrap();
}
