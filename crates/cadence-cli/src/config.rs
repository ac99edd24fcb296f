//! `cadence.toml` layout and agent assembly.

use anyhow::Context;
use cadence_agent::{AgentDef, AgentTree, ComponentRegistry, LlmAgent, RunConfig, RunnerConfig};
use cadence_mcp::StdioServerConfig;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::info;

/// Environment variable consulted when the model section has no `api_key`.
pub const API_KEY_ENV: &str = "CADENCE_API_KEY";

#[derive(Debug, Deserialize)]
pub struct CadenceConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub model: ModelSection,
    pub agent: AgentSection,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub mcp_servers: Vec<StdioServerConfig>,
}

/// Model backend key plus the settings handed to its factory.
#[derive(Debug, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct AgentSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instruction: String,
    /// Registry keys of built-in tools.
    #[serde(default)]
    pub tools: Vec<String>,
    pub output_key: Option<String>,
    pub max_steps: Option<u32>,
}

fn default_app_name() -> String {
    "cadence".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_provider() -> String {
    "openai".to_string()
}

impl CadenceConfig {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Builds the single-agent tree described by the `[agent]` section.
    pub fn build_agents(&self, registry: &ComponentRegistry) -> anyhow::Result<AgentTree> {
        let mut settings = self.model.settings.clone();
        if !settings.contains_key("api_key") {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                settings.insert("api_key".into(), Value::String(key));
            }
        }
        let model = registry
            .create_model(&self.model.provider, &Value::Object(settings))
            .with_context(|| format!("creating model '{}'", self.model.provider))?;

        let section = &self.agent;
        let mut agent = LlmAgent::new(&section.name, model)
            .with_description(&section.description)
            .with_instruction(&section.instruction);
        for key in &section.tools {
            let tool = registry
                .create_tool(key, &Value::Null)
                .with_context(|| format!("creating tool '{key}'"))?;
            agent = agent.with_tool(tool);
        }
        for server in &self.mcp_servers {
            let toolset = registry.create_toolset(
                cadence_agent::registry::MCP_STDIO_TOOLSET,
                &serde_json::to_value(server)?,
            )?;
            agent = agent.with_toolset(toolset);
        }
        if let Some(key) = &section.output_key {
            agent = agent.with_output_key(key);
        }
        if let Some(max_steps) = section.max_steps {
            agent = agent.with_max_steps(max_steps);
        }

        info!(
            agent = %section.name,
            tools = section.tools.len(),
            mcp_servers = self.mcp_servers.len(),
            "Agent assembled"
        );
        Ok(AgentTree::build(AgentDef::llm(agent))?)
    }
}
