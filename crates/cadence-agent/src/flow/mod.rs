//! The single-agent step loop.
//!
//! One step: resolve tools, build the request, call the model (or take a
//! hook's override), turn responses into events, then run any requested
//! function calls. Steps repeat while the model keeps calling tools and the
//! agent's step budget allows.

pub mod functions;
pub mod request;

use crate::agent::{new_event, run_agent, AgentId, AgentKind, AgentNode, LlmAgent, TurnOutcome};
use crate::context::InvocationContext;
use crate::llm::{LlmRequest, LlmResponse};
use crate::plugin::CallbackContext;
use crate::stream::StreamingResponseAggregator;
use cadence_core::{CadenceError, CadenceResult, Event, EventActions};
use cadence_tools::{Tool, TransferToAgentTool};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use functions::{assign_call_ids, execute_calls, GENERATED_CALL_ID_PREFIX};
pub use request::{build_contents, build_request, inject_state, is_visible, USER_AUTHOR};

enum StepOutcome {
    Continue,
    Done { escalated: bool },
    Transfer(String),
}

/// Runs an LLM agent's turn to completion.
///
/// `carried` holds actions written before the turn started. They are merged
/// into the turn's first recorded event instead of being recorded alone.
pub(crate) async fn run_llm_agent(
    ctx: &InvocationContext,
    id: AgentId,
    mut carried: EventActions,
) -> CadenceResult<TurnOutcome> {
    let node = ctx.agents.node(id);
    let AgentKind::Llm(agent) = &node.kind else {
        return Err(CadenceError::Agent(format!(
            "Agent '{}' is not an LLM agent",
            node.name
        )));
    };

    let mut steps = 0;
    loop {
        if ctx.is_ended() {
            if !carried.is_empty() {
                ctx.emit(new_event(ctx, &node.name).with_actions(carried)).await?;
            }
            return Ok(TurnOutcome::default());
        }
        steps += 1;
        debug!(invocation_id = %ctx.invocation_id, agent = %node.name, step = steps, "Agent step");

        let carried = std::mem::take(&mut carried);
        match run_step(ctx, node, agent, steps, carried).await? {
            StepOutcome::Continue => {}
            StepOutcome::Done { escalated } => return Ok(TurnOutcome { escalated }),
            StepOutcome::Transfer(target) => {
                let target_id = ctx.agents.find(&target).ok_or_else(|| {
                    CadenceError::Agent(format!("Transfer target '{target}' not found"))
                })?;
                info!(from = %node.name, to = %target, "Transferring to agent");
                return run_agent(ctx.clone(), target_id).await;
            }
        }
    }
}

/// The agent's tools for this step: its own, those of its toolsets, and the
/// transfer tool when it has transfer targets.
///
/// Toolsets apply their own discovery retries; a `ToolLoading` error ends the run.
async fn resolve_tools(
    ctx: &InvocationContext,
    agent: &LlmAgent,
    transfer_targets: &[AgentId],
) -> CadenceResult<Vec<Arc<dyn Tool>>> {
    let mut tools: Vec<Arc<dyn Tool>> = agent.tools.tools().to_vec();
    for toolset in &agent.toolsets {
        tools.extend(toolset.tools().await?);
    }
    if !transfer_targets.is_empty() {
        let names = transfer_targets
            .iter()
            .map(|&target| ctx.agents.node(target).name.clone())
            .collect();
        tools.push(Arc::new(TransferToAgentTool::new(names)));
    }
    Ok(tools)
}

/// Collects one step's model output into events.
///
/// Partial events go out immediately. Function-call events go out
/// immediately and are queued for execution. Any other event is held back so
/// that the last one can be marked final.
struct StepEvents<'a> {
    ctx: &'a InvocationContext,
    node: &'a AgentNode,
    held: Option<Event>,
    calls: Vec<Event>,
    pending_actions: EventActions,
}

impl<'a> StepEvents<'a> {
    fn new(ctx: &'a InvocationContext, node: &'a AgentNode, carried: EventActions) -> Self {
        Self {
            ctx,
            node,
            held: None,
            calls: Vec::new(),
            pending_actions: carried,
        }
    }

    fn make_event(&mut self, response: LlmResponse) -> Event {
        let mut event = new_event(self.ctx, &self.node.name);
        event.content = response.content;
        event.partial = response.partial;
        event.turn_complete = response.turn_complete;
        event.interrupted = response.interrupted;
        event.error_code = response.error_code;
        event.error_message = response.error_message;
        if !event.partial {
            event.actions = std::mem::take(&mut self.pending_actions);
        }
        assign_call_ids(&mut event);
        event
    }

    async fn push(&mut self, response: LlmResponse, actions: EventActions) -> CadenceResult<()> {
        self.pending_actions.merge(actions);
        let event = self.make_event(response);
        if event.partial {
            return self.ctx.emit(event).await;
        }
        if let Some(held) = self.held.take() {
            self.ctx.emit(held).await?;
        }
        if event.function_calls().is_empty() {
            self.held = Some(event);
        } else {
            self.ctx.emit(event.clone()).await?;
            self.calls.push(event);
        }
        Ok(())
    }
}

async fn after_model(
    ctx: &InvocationContext,
    node: &AgentNode,
    cb: &mut CallbackContext<'_>,
    response: LlmResponse,
) -> CadenceResult<LlmResponse> {
    let mut altered = ctx.plugins.run_after_model(cb, &response).await?;
    if altered.is_none() {
        altered = node.callbacks.run_after_model(cb, &response).await?;
    }
    Ok(altered.unwrap_or(response))
}

async fn recover_model_error(
    ctx: &InvocationContext,
    node: &AgentNode,
    cb: &mut CallbackContext<'_>,
    request: &LlmRequest,
    error: CadenceError,
) -> CadenceResult<LlmResponse> {
    if !error.is_plugin_interceptable() {
        return Err(error);
    }
    warn!(agent = %node.name, error = %error, "Model call failed");
    let mut recovered = ctx.plugins.run_on_model_error(cb, request, &error).await?;
    if recovered.is_none() {
        recovered = node.callbacks.run_on_model_error(cb, request, &error).await?;
    }
    recovered.ok_or(error)
}

/// Feeds one response through `after_model` into the step's events.
async fn accept(
    out: &mut StepEvents<'_>,
    cb: &mut CallbackContext<'_>,
    response: LlmResponse,
) -> CadenceResult<()> {
    let response = after_model(out.ctx, out.node, cb, response).await?;
    let actions = cb.take_actions();
    out.push(response, actions).await
}

/// Calls the model, or takes a `before_model` override, and collects the
/// resulting events.
async fn call_model(
    out: &mut StepEvents<'_>,
    agent: &LlmAgent,
    cb: &mut CallbackContext<'_>,
    request: &mut LlmRequest,
) -> CadenceResult<()> {
    let ctx = out.ctx;
    let node = out.node;

    let mut overridden = ctx.plugins.run_before_model(cb, request).await?;
    if overridden.is_none() {
        overridden = node.callbacks.run_before_model(cb, request).await?;
    }
    if let Some(response) = overridden {
        return accept(out, cb, response).await;
    }

    ctx.increment_llm_calls()?;

    if !ctx.run_config.is_streaming() {
        let response = match agent.model.generate(request).await {
            Ok(response) => response,
            Err(e) => recover_model_error(ctx, node, cb, request, e).await?,
        };
        return accept(out, cb, response).await;
    }

    let mut chunks = match agent.model.generate_stream(request).await {
        Ok(chunks) => chunks,
        Err(e) => {
            let response = recover_model_error(ctx, node, cb, request, e).await?;
            return accept(out, cb, response).await;
        }
    };

    let mut aggregator = StreamingResponseAggregator::new();
    while let Some(chunk) = chunks.recv().await {
        match chunk {
            Ok(chunk) => {
                for response in aggregator.process(chunk) {
                    accept(out, cb, response).await?;
                }
            }
            Err(e) => {
                let response = recover_model_error(ctx, node, cb, request, e).await?;
                return accept(out, cb, response).await;
            }
        }
        if ctx.is_ended() {
            return Ok(());
        }
    }
    if let Some(response) = aggregator.close() {
        accept(out, cb, response).await?;
    }
    Ok(())
}

fn output_text(event: &Event) -> Option<String> {
    let content = event.content.as_ref()?;
    (!content.parts.is_empty()).then(|| content.text())
}

async fn run_step(
    ctx: &InvocationContext,
    node: &AgentNode,
    agent: &LlmAgent,
    step: u32,
    carried: EventActions,
) -> CadenceResult<StepOutcome> {
    let transfer_targets = ctx.agents.transfer_targets(node.id);
    let tools = resolve_tools(ctx, agent, &transfer_targets).await?;
    let pending = &carried.state_delta;
    let mut request = build_request(ctx, node, agent, &tools, &transfer_targets, pending).await?;

    let mut state = ctx.state_snapshot().await;
    state.extend(pending.iter().map(|(k, v)| (k.clone(), v.clone())));
    let mut cb = CallbackContext::new(ctx, &node.name, state);
    let mut out = StepEvents::new(ctx, node, carried);
    call_model(&mut out, agent, &mut cb, &mut request).await?;

    let StepEvents {
        held,
        calls,
        pending_actions,
        ..
    } = out;

    if calls.is_empty() {
        let mut last = held.unwrap_or_else(|| new_event(ctx, &node.name));
        last.actions.merge(pending_actions);
        if let Some(key) = &agent.output_key {
            if let Some(text) = output_text(&last) {
                last.actions.state_delta.insert(key.clone(), Value::String(text));
            }
        }
        last.final_response = true;
        let escalated = last.actions.escalate;
        ctx.emit(last).await?;
        return Ok(StepOutcome::Done { escalated });
    }

    if let Some(mut held) = held {
        held.actions.merge(pending_actions);
        ctx.emit(held).await?;
    }

    let mut combined = EventActions::default();
    let mut ends_turn = false;
    let last_index = calls.len() - 1;
    for (index, call_event) in calls.iter().enumerate() {
        let mut response = execute_calls(ctx, node, &tools, call_event).await?;
        combined.merge(response.actions.clone());

        if index == last_index {
            let budget_left = agent.step_budget_left(step);
            if !budget_left {
                debug!(agent = %node.name, step, "Step budget exhausted");
            }
            ends_turn = !budget_left
                || combined.transfer_to_agent.is_some()
                || combined.skip_summarization
                || combined.escalate
                || !combined.requested_tool_confirmations.is_empty()
                || ctx.is_ended();
            response.final_response = ends_turn;
        }
        ctx.emit(response).await?;
    }

    if let Some(target) = combined.transfer_to_agent {
        return Ok(StepOutcome::Transfer(target));
    }
    if ends_turn {
        return Ok(StepOutcome::Done {
            escalated: combined.escalate,
        });
    }
    Ok(StepOutcome::Continue)
}
