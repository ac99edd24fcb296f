use crate::tool::{into_response_map, Tool, ToolContext, ToolDeclaration};
use async_trait::async_trait;
use cadence_core::CadenceResult;
use serde_json::{Map, Value};

type Handler = dyn Fn(Map<String, Value>, &mut ToolContext) -> CadenceResult<Value> + Send + Sync;

/// A tool backed by a plain Rust closure.
///
/// A non-object return value is wrapped as `{"result": value}`.
pub struct FunctionTool {
    declaration: ToolDeclaration,
    handler: Box<Handler>,
}

impl FunctionTool {
    pub fn new<F>(declaration: ToolDeclaration, handler: F) -> Self
    where
        F: Fn(Map<String, Value>, &mut ToolContext) -> CadenceResult<Value> + Send + Sync + 'static,
    {
        Self {
            declaration,
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn declaration(&self) -> &ToolDeclaration {
        &self.declaration
    }

    async fn invoke(
        &self,
        args: Map<String, Value>,
        ctx: &mut ToolContext,
    ) -> CadenceResult<Map<String, Value>> {
        let value = (self.handler)(args, ctx)?;
        Ok(into_response_map(value))
    }
}
