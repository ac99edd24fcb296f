use crate::llm::LlmBackend;
use cadence_core::{CadenceResult, StateMap};
use cadence_tools::{Tool, ToolRegistry, Toolset};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Computes an instruction from the current session state.
pub type InstructionProvider = Arc<dyn Fn(&StateMap) -> CadenceResult<String> + Send + Sync>;

/// The system instruction of an LLM agent.
#[derive(Clone)]
pub enum Instruction {
    /// Text with `{key}` / `{key?}` state placeholders.
    Static(String),
    /// Computed per request. The result is used verbatim, without placeholder substitution.
    Provider(InstructionProvider),
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Self::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

impl Default for Instruction {
    fn default() -> Self {
        Self::Static(String::new())
    }
}

/// Which session events are sent to the model as history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IncludeContents {
    /// All visible events of the session.
    #[default]
    Default,
    /// Only the current turn, starting at the latest user or foreign-agent event.
    None,
}

/// A model-driven agent: instruction, tools, and the knobs of its step loop.
#[derive(Clone)]
pub struct LlmAgent {
    pub name: String,
    pub description: String,
    pub model: Arc<dyn LlmBackend>,
    pub instruction: Instruction,
    pub tools: ToolRegistry,
    pub toolsets: Vec<Arc<dyn Toolset>>,
    /// State key receiving the text of the agent's final response.
    pub output_key: Option<String>,
    /// Model/tool steps per turn. Unbounded when unset.
    pub max_steps: Option<u32>,
    pub include_contents: IncludeContents,
    pub disallow_transfer_to_parent: bool,
    pub disallow_transfer_to_peers: bool,
    /// Generation knobs; per-run settings take precedence.
    pub generation: Map<String, Value>,
}

impl LlmAgent {
    pub fn new(name: impl Into<String>, model: Arc<dyn LlmBackend>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            model,
            instruction: Instruction::default(),
            tools: ToolRegistry::new(),
            toolsets: Vec::new(),
            output_key: None,
            max_steps: None,
            include_contents: IncludeContents::Default,
            disallow_transfer_to_parent: false,
            disallow_transfer_to_peers: false,
            generation: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Instruction::Static(instruction.into());
        self
    }

    pub fn with_instruction_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&StateMap) -> CadenceResult<String> + Send + Sync + 'static,
    {
        self.instruction = Instruction::Provider(Arc::new(provider));
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_toolset(mut self, toolset: Arc<dyn Toolset>) -> Self {
        self.toolsets.push(toolset);
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_include_contents(mut self, include: IncludeContents) -> Self {
        self.include_contents = include;
        self
    }

    pub fn with_generation(mut self, key: impl Into<String>, value: Value) -> Self {
        self.generation.insert(key.into(), value);
        self
    }

    pub fn disallow_transfer_to_parent(mut self) -> Self {
        self.disallow_transfer_to_parent = true;
        self
    }

    pub fn disallow_transfer_to_peers(mut self) -> Self {
        self.disallow_transfer_to_peers = true;
        self
    }

    /// Whether another step is allowed after `steps` completed ones.
    pub(crate) fn step_budget_left(&self, steps: u32) -> bool {
        self.max_steps.map_or(true, |max| steps < max)
    }
}

impl fmt::Debug for LlmAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmAgent")
            .field("name", &self.name)
            .field("model", &self.model.model_name())
            .field("tools", &self.tools.len())
            .field("toolsets", &self.toolsets.len())
            .field("output_key", &self.output_key)
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}
