use crate::client::{McpClient, StdioServerConfig, ToolProvider};
use crate::protocol::McpToolDef;
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult};
use cadence_tools::{retry_discovery, Tool, ToolContext, ToolDeclaration, ToolFilter, Toolset};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Opens a connection to a tool server.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self) -> CadenceResult<Arc<dyn ToolProvider>>;
}

/// Connects by spawning a stdio server process.
pub struct StdioConnector {
    config: StdioServerConfig,
}

impl StdioConnector {
    pub fn new(config: StdioServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl McpConnector for StdioConnector {
    async fn connect(&self) -> CadenceResult<Arc<dyn ToolProvider>> {
        Ok(Arc::new(McpClient::connect(&self.config).await?))
    }
}

/// Toolset backed by a remote tool server.
///
/// The connection is opened lazily and cached. Discovery (connect plus
/// `tools/list`) is retried up to three attempts; a failed attempt drops the
/// cached connection so the next one reconnects.
pub struct McpToolset {
    name: String,
    connector: Arc<dyn McpConnector>,
    provider: Mutex<Option<Arc<dyn ToolProvider>>>,
    filter: ToolFilter,
}

impl McpToolset {
    pub fn new(name: impl Into<String>, connector: Arc<dyn McpConnector>) -> Self {
        Self {
            name: name.into(),
            connector,
            provider: Mutex::new(None),
            filter: ToolFilter::all(),
        }
    }

    /// Builds a toolset for a stdio server, honouring its configured filter.
    pub fn stdio(config: StdioServerConfig) -> Self {
        let filter = config
            .tool_filter
            .clone()
            .map_or_else(ToolFilter::all, ToolFilter::allow);
        let name = config.display_name().to_string();
        Self::new(name, Arc::new(StdioConnector::new(config))).with_filter(filter)
    }

    pub fn with_filter(mut self, filter: ToolFilter) -> Self {
        self.filter = filter;
        self
    }

    async fn discover(&self, attempt: u32) -> CadenceResult<Vec<Arc<dyn Tool>>> {
        let provider = {
            let mut cached = self.provider.lock().await;
            match cached.as_ref() {
                Some(p) => p.clone(),
                None => {
                    debug!(toolset = %self.name, attempt, "Connecting to tool server");
                    let p = self.connector.connect().await?;
                    *cached = Some(p.clone());
                    p
                }
            }
        };

        let defs = match provider.list_tools().await {
            Ok(defs) => defs,
            Err(e) => {
                *self.provider.lock().await = None;
                let _ = provider.close().await;
                return Err(e);
            }
        };

        let tools: Vec<Arc<dyn Tool>> = defs
            .into_iter()
            .filter(|d| self.filter.allows(&d.name))
            .map(|d| Arc::new(McpTool::new(d, provider.clone())) as Arc<dyn Tool>)
            .collect();
        info!(toolset = %self.name, tools = tools.len(), "Tools discovered");
        Ok(tools)
    }
}

#[async_trait]
impl Toolset for McpToolset {
    fn name(&self) -> &str {
        &self.name
    }

    async fn tools(&self) -> CadenceResult<Vec<Arc<dyn Tool>>> {
        retry_discovery(&self.name, |attempt| self.discover(attempt)).await
    }

    async fn close(&self) -> CadenceResult<()> {
        if let Some(provider) = self.provider.lock().await.take() {
            provider.close().await?;
        }
        Ok(())
    }
}

/// One remote tool exposed to the agent.
pub struct McpTool {
    declaration: ToolDeclaration,
    provider: Arc<dyn ToolProvider>,
}

impl McpTool {
    pub fn new(def: McpToolDef, provider: Arc<dyn ToolProvider>) -> Self {
        Self {
            declaration: ToolDeclaration::new(def.name, def.description, def.input_schema),
            provider,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn declaration(&self) -> &ToolDeclaration {
        &self.declaration
    }

    async fn invoke(
        &self,
        args: Map<String, Value>,
        _ctx: &mut ToolContext,
    ) -> CadenceResult<Map<String, Value>> {
        let result = self
            .provider
            .call_tool(self.name(), Value::Object(args))
            .await?;
        if result.is_error {
            return Err(CadenceError::tool(self.name(), result.text()));
        }
        let mut response = Map::new();
        response.insert("content".into(), serde_json::to_value(&result.content)?);
        Ok(response)
    }
}
