//! Control-flow tools the runtime understands natively.

use crate::tool::{Tool, ToolContext, ToolDeclaration};
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult};
use serde_json::{json, Map, Value};

/// Name of the agent-transfer tool.
pub const TRANSFER_TO_AGENT: &str = "transfer_to_agent";
/// Name of the loop-exit tool.
pub const EXIT_LOOP: &str = "exit_loop";

/// Hands control to another agent in the same invocation.
pub struct TransferToAgentTool {
    declaration: ToolDeclaration,
    targets: Vec<String>,
}

impl TransferToAgentTool {
    /// Creates the tool restricted to the given agent names.
    pub fn new(targets: Vec<String>) -> Self {
        let declaration = ToolDeclaration::new(
            TRANSFER_TO_AGENT,
            "Transfer the question to another agent that is better suited to answer it.",
            json!({
                "type": "object",
                "properties": {
                    "agent_name": {
                        "type": "string",
                        "description": "Name of the agent to transfer to.",
                        "enum": targets,
                    }
                },
                "required": ["agent_name"],
            }),
        );
        Self {
            declaration,
            targets,
        }
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }
}

#[async_trait]
impl Tool for TransferToAgentTool {
    fn declaration(&self) -> &ToolDeclaration {
        &self.declaration
    }

    async fn invoke(
        &self,
        args: Map<String, Value>,
        ctx: &mut ToolContext,
    ) -> CadenceResult<Map<String, Value>> {
        let target = args
            .get("agent_name")
            .and_then(Value::as_str)
            .ok_or_else(|| CadenceError::tool(TRANSFER_TO_AGENT, "missing 'agent_name'"))?;
        if !self.targets.iter().any(|t| t == target) {
            return Err(CadenceError::tool(
                TRANSFER_TO_AGENT,
                format!("agent '{target}' is not a valid transfer target"),
            ));
        }
        ctx.actions.transfer_to_agent = Some(target.to_string());
        Ok(Map::new())
    }
}

/// Ends the enclosing loop agent.
pub struct ExitLoopTool {
    declaration: ToolDeclaration,
}

impl ExitLoopTool {
    pub fn new() -> Self {
        Self {
            declaration: ToolDeclaration::new(
                EXIT_LOOP,
                "Exits the loop. Call this function only when you are instructed to do so.",
                json!({"type": "object", "properties": {}}),
            ),
        }
    }
}

impl Default for ExitLoopTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ExitLoopTool {
    fn declaration(&self) -> &ToolDeclaration {
        &self.declaration
    }

    async fn invoke(
        &self,
        _args: Map<String, Value>,
        ctx: &mut ToolContext,
    ) -> CadenceResult<Map<String, Value>> {
        ctx.actions.escalate = true;
        ctx.actions.skip_summarization = true;
        Ok(Map::new())
    }
}

/// Returns its arguments unchanged. Handy for wiring checks.
pub struct EchoTool {
    declaration: ToolDeclaration,
}

impl EchoTool {
    pub fn new() -> Self {
        Self {
            declaration: ToolDeclaration::new(
                "echo",
                "Echoes the given arguments back.",
                json!({"type": "object", "additionalProperties": true}),
            ),
        }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn declaration(&self) -> &ToolDeclaration {
        &self.declaration
    }

    async fn invoke(
        &self,
        args: Map<String, Value>,
        _ctx: &mut ToolContext,
    ) -> CadenceResult<Map<String, Value>> {
        Ok(args)
    }
}
