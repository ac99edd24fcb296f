//! Execution of the function calls requested by a model response.

use crate::agent::{new_event, AgentNode};
use crate::context::InvocationContext;
use crate::plugin::JsonMap;
use cadence_core::{
    CadenceError, CadenceResult, Content, Event, EventActions, FunctionCall, FunctionResponse,
    Part, ROLE_USER,
};
use cadence_tools::{Tool, ToolContext};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of ids generated for function calls the model left unnamed.
pub const GENERATED_CALL_ID_PREFIX: &str = "cadence-";

/// Gives every function call in `event` an id.
pub fn assign_call_ids(event: &mut Event) {
    let Some(content) = event.content.as_mut() else {
        return;
    };
    for part in &mut content.parts {
        if let Part::FunctionCall(call) = part {
            if call.id.is_empty() {
                call.id = format!("{GENERATED_CALL_ID_PREFIX}{}", Uuid::new_v4());
            }
        }
    }
}

fn call_args(call: &FunctionCall) -> CadenceResult<JsonMap> {
    match &call.args {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(JsonMap::new()),
        other => Err(CadenceError::tool(
            &call.name,
            format!("arguments must be a JSON object, got {other}"),
        )),
    }
}

/// Runs one tool through the before/after/error hooks.
async fn run_tool(
    ctx: &InvocationContext,
    node: &AgentNode,
    tool: &dyn Tool,
    call: &FunctionCall,
    tool_ctx: &mut ToolContext,
) -> CadenceResult<JsonMap> {
    let args = call_args(call)?;

    let mut result = ctx.plugins.run_before_tool(tool, &args, tool_ctx).await?;
    if result.is_none() {
        result = node.callbacks.run_before_tool(tool, &args, tool_ctx).await?;
    }

    let result = match result {
        Some(result) => {
            debug!(tool = %call.name, call_id = %call.id, "Tool call short-circuited by hook");
            result
        }
        None => {
            info!(
                invocation_id = %ctx.invocation_id,
                agent = %node.name,
                tool = %call.name,
                call_id = %call.id,
                "Executing tool call"
            );
            match tool.invoke(args.clone(), tool_ctx).await {
                Ok(result) => result,
                Err(e) if e.is_plugin_interceptable() => {
                    warn!(tool = %call.name, error = %e, "Tool execution failed");
                    let mut recovered = ctx.plugins.run_on_tool_error(tool, &args, tool_ctx, &e).await?;
                    if recovered.is_none() {
                        recovered = node
                            .callbacks
                            .run_on_tool_error(tool, &args, tool_ctx, &e)
                            .await?;
                    }
                    recovered.ok_or(e)?
                }
                Err(e) => return Err(e),
            }
        }
    };

    let mut altered = ctx
        .plugins
        .run_after_tool(tool, &args, tool_ctx, &result)
        .await?;
    if altered.is_none() {
        altered = node
            .callbacks
            .run_after_tool(tool, &args, tool_ctx, &result)
            .await?;
    }
    Ok(altered.unwrap_or(result))
}

/// Executes the calls of `call_event` in order and returns one merged
/// function-response event.
///
/// Each call sees the session state overlaid with the writes of the calls
/// before it.
pub async fn execute_calls(
    ctx: &InvocationContext,
    node: &AgentNode,
    tools: &[Arc<dyn Tool>],
    call_event: &Event,
) -> CadenceResult<Event> {
    let mut parts = Vec::new();
    let mut actions = EventActions::default();

    for call in call_event.function_calls() {
        let tool = tools
            .iter()
            .find(|t| t.name() == call.name)
            .ok_or_else(|| CadenceError::ToolNotFound(call.name.clone()))?;

        let mut state = ctx.state_snapshot().await;
        state.extend(actions.state_delta.clone());
        let mut tool_ctx = ToolContext::new(&ctx.invocation_id, &node.name, &call.id, state);

        let response = run_tool(ctx, node, tool.as_ref(), call, &mut tool_ctx).await?;
        actions.merge(tool_ctx.actions);
        parts.push(Part::FunctionResponse(FunctionResponse {
            id: call.id.clone(),
            name: call.name.clone(),
            response,
        }));
    }

    Ok(new_event(ctx, &node.name)
        .with_content(Content::new(ROLE_USER, parts))
        .with_actions(actions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ROLE_MODEL;
    use serde_json::json;

    #[test]
    fn test_assign_call_ids_fills_only_missing() {
        let content = Content::new(
            ROLE_MODEL,
            vec![
                Part::FunctionCall(FunctionCall::new("a", json!({}))),
                Part::FunctionCall(FunctionCall::new("b", json!({})).with_id("keep")),
            ],
        );
        let mut event = Event::new("inv", "agent").with_content(content);
        assign_call_ids(&mut event);

        let calls = event.function_calls();
        assert!(calls[0].id.starts_with(GENERATED_CALL_ID_PREFIX));
        assert_eq!(calls[1].id, "keep");
    }

    #[test]
    fn test_call_args_shapes() {
        assert!(call_args(&FunctionCall::new("f", Value::Null)).unwrap().is_empty());
        assert_eq!(
            call_args(&FunctionCall::new("f", json!({"n": 6}))).unwrap()["n"],
            json!(6)
        );
        let err = call_args(&FunctionCall::new("f", json!([1]))).unwrap_err();
        assert!(matches!(err, CadenceError::ToolExecution { .. }));
    }
}
