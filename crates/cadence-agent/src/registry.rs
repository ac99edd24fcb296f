//! Explicit name-to-factory registry used by assembly code.
//!
//! Components are created from a string key and a JSON settings value. The
//! registry is a plain value passed to whoever assembles the agent graph;
//! nothing is registered globally.

use crate::backends::OpenAiBackend;
use crate::config::ModelConfig;
use crate::llm::LlmBackend;
use cadence_core::{CadenceError, CadenceResult};
use cadence_mcp::{McpToolset, StdioServerConfig};
use cadence_tools::{EchoTool, ExitLoopTool, Tool, Toolset, EXIT_LOOP};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a tool from its settings.
pub type ToolFactory = Arc<dyn Fn(&Value) -> CadenceResult<Arc<dyn Tool>> + Send + Sync>;
/// Builds a toolset from its settings.
pub type ToolsetFactory = Arc<dyn Fn(&Value) -> CadenceResult<Arc<dyn Toolset>> + Send + Sync>;
/// Builds a model backend from its settings.
pub type ModelFactory = Arc<dyn Fn(&Value) -> CadenceResult<Arc<dyn LlmBackend>> + Send + Sync>;

/// Key of the bundled OpenAI-compatible model backend.
pub const OPENAI_MODEL: &str = "openai";
/// Key of the stdio tool-server toolset.
pub const MCP_STDIO_TOOLSET: &str = "mcp_stdio";

#[derive(Clone, Default)]
pub struct ComponentRegistry {
    tools: HashMap<String, ToolFactory>,
    toolsets: HashMap<String, ToolsetFactory>,
    models: HashMap<String, ModelFactory>,
}

fn settings<T: DeserializeOwned>(kind: &str, key: &str, value: &Value) -> CadenceResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| CadenceError::Config(format!("Invalid settings for {kind} '{key}': {e}")))
}

fn unknown(kind: &str, key: &str) -> CadenceError {
    CadenceError::Config(format!("Unknown {kind} '{key}'"))
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the bundled components: the `exit_loop` and `echo`
    /// tools, the `openai` model and the `mcp_stdio` toolset.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_tool(EXIT_LOOP, |_| Ok(Arc::new(ExitLoopTool::new()) as Arc<dyn Tool>));
        registry.register_tool("echo", |_| Ok(Arc::new(EchoTool::new()) as Arc<dyn Tool>));
        registry.register_model(OPENAI_MODEL, |value| {
            let config: ModelConfig = settings("model", OPENAI_MODEL, value)?;
            Ok(Arc::new(OpenAiBackend::new(config)?) as Arc<dyn LlmBackend>)
        });
        registry.register_toolset(MCP_STDIO_TOOLSET, |value| {
            let config: StdioServerConfig = settings("toolset", MCP_STDIO_TOOLSET, value)?;
            Ok(Arc::new(McpToolset::stdio(config)) as Arc<dyn Toolset>)
        });
        registry
    }

    pub fn register_tool<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> CadenceResult<Arc<dyn Tool>> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!(key = %key, "Registered tool factory");
        self.tools.insert(key, Arc::new(factory));
    }

    pub fn register_toolset<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> CadenceResult<Arc<dyn Toolset>> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!(key = %key, "Registered toolset factory");
        self.toolsets.insert(key, Arc::new(factory));
    }

    pub fn register_model<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> CadenceResult<Arc<dyn LlmBackend>> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!(key = %key, "Registered model factory");
        self.models.insert(key, Arc::new(factory));
    }

    pub fn create_tool(&self, key: &str, settings: &Value) -> CadenceResult<Arc<dyn Tool>> {
        let factory = self.tools.get(key).ok_or_else(|| unknown("tool", key))?;
        factory(settings)
    }

    pub fn create_toolset(&self, key: &str, settings: &Value) -> CadenceResult<Arc<dyn Toolset>> {
        let factory = self.toolsets.get(key).ok_or_else(|| unknown("toolset", key))?;
        factory(settings)
    }

    pub fn create_model(&self, key: &str, settings: &Value) -> CadenceResult<Arc<dyn LlmBackend>> {
        let factory = self.models.get(key).ok_or_else(|| unknown("model", key))?;
        factory(settings)
    }

    pub fn tool_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = ComponentRegistry::with_builtins();
        assert_eq!(registry.tool_keys(), vec!["echo", "exit_loop"]);
        let tool = registry.create_tool(EXIT_LOOP, &Value::Null).unwrap();
        assert_eq!(tool.name(), EXIT_LOOP);
    }

    #[test]
    fn test_unknown_key_is_config_error() {
        let registry = ComponentRegistry::with_builtins();
        let err = registry.create_tool("teleport", &Value::Null).err().unwrap();
        assert!(matches!(err, CadenceError::Config(msg) if msg.contains("teleport")));
    }

    #[test]
    fn test_model_factory_validates_settings() {
        let registry = ComponentRegistry::with_builtins();
        let model = registry
            .create_model(OPENAI_MODEL, &json!({"model_id": "gpt-4o-mini"}))
            .unwrap();
        assert_eq!(model.model_name(), "gpt-4o-mini");

        let err = registry.create_model(OPENAI_MODEL, &json!({"temperature": 1})).err().unwrap();
        assert!(matches!(err, CadenceError::Config(_)));
    }

    #[test]
    fn test_custom_factory() {
        let mut registry = ComponentRegistry::new();
        registry.register_tool("loud_echo", |_| Ok(Arc::new(EchoTool::new()) as Arc<dyn Tool>));
        assert!(registry.create_tool("loud_echo", &Value::Null).is_ok());
        assert!(registry.create_toolset(MCP_STDIO_TOOLSET, &Value::Null).is_err());
    }
}
