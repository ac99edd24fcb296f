//! Ordered hook pipeline with first-override-wins semantics.
//!
//! Every hook returns `Ok(None)` for "no opinion" or `Ok(Some(value))` to
//! override. Plugins run in registration order and the first override stops
//! the dispatch. An `Err` from any plugin fails the invocation. For the two
//! error hooks an override is a recovery value; with no override the original
//! error propagates.

use crate::context::InvocationContext;
use crate::llm::{LlmRequest, LlmResponse};
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, Content, Event, EventActions, StateMap};
use cadence_tools::{Tool, ToolContext};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tool arguments and results.
pub type JsonMap = Map<String, Value>;

/// Context handed to agent- and model-level hooks.
///
/// State writes land in `actions` and are attached to the next event the
/// agent emits.
pub struct CallbackContext<'a> {
    pub invocation: &'a InvocationContext,
    pub agent_name: &'a str,
    pub actions: EventActions,
    state: StateMap,
}

impl<'a> CallbackContext<'a> {
    pub fn new(invocation: &'a InvocationContext, agent_name: &'a str, state: StateMap) -> Self {
        Self {
            invocation,
            agent_name,
            actions: EventActions::default(),
            state,
        }
    }

    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.actions
            .state_delta
            .get(key)
            .or_else(|| self.state.get(key))
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.actions.state_delta.insert(key.into(), value);
    }

    /// Takes the accumulated actions, leaving an empty set behind.
    pub fn take_actions(&mut self) -> EventActions {
        std::mem::take(&mut self.actions)
    }
}

/// An observer that may intercept any stage of a run.
///
/// All hooks default to "no opinion".
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// May replace the incoming user message.
    async fn on_user_message(
        &self,
        _ctx: &InvocationContext,
        _message: &Content,
    ) -> CadenceResult<Option<Content>> {
        Ok(None)
    }

    /// An override ends the run with that content.
    async fn before_run(&self, _ctx: &InvocationContext) -> CadenceResult<Option<Content>> {
        Ok(None)
    }

    /// May replace the event yielded to the caller. The recorded event is unchanged.
    async fn on_event(&self, _ctx: &InvocationContext, _event: &Event) -> CadenceResult<Option<Event>> {
        Ok(None)
    }

    /// Runs once per run, even after a failure.
    async fn after_run(&self, _ctx: &InvocationContext) -> CadenceResult<()> {
        Ok(())
    }

    /// An override skips the agent and is emitted as its response.
    async fn before_agent(&self, _ctx: &mut CallbackContext<'_>) -> CadenceResult<Option<Content>> {
        Ok(None)
    }

    /// An override is emitted as an extra agent response.
    async fn after_agent(&self, _ctx: &mut CallbackContext<'_>) -> CadenceResult<Option<Content>> {
        Ok(None)
    }

    /// An override skips the model call.
    async fn before_model(
        &self,
        _ctx: &mut CallbackContext<'_>,
        _request: &mut LlmRequest,
    ) -> CadenceResult<Option<LlmResponse>> {
        Ok(None)
    }

    async fn after_model(
        &self,
        _ctx: &mut CallbackContext<'_>,
        _response: &LlmResponse,
    ) -> CadenceResult<Option<LlmResponse>> {
        Ok(None)
    }

    async fn on_model_error(
        &self,
        _ctx: &mut CallbackContext<'_>,
        _request: &LlmRequest,
        _error: &CadenceError,
    ) -> CadenceResult<Option<LlmResponse>> {
        Ok(None)
    }

    /// An override is used as the tool result without invoking the tool.
    async fn before_tool(
        &self,
        _tool: &dyn Tool,
        _args: &JsonMap,
        _ctx: &mut ToolContext,
    ) -> CadenceResult<Option<JsonMap>> {
        Ok(None)
    }

    async fn after_tool(
        &self,
        _tool: &dyn Tool,
        _args: &JsonMap,
        _ctx: &mut ToolContext,
        _result: &JsonMap,
    ) -> CadenceResult<Option<JsonMap>> {
        Ok(None)
    }

    async fn on_tool_error(
        &self,
        _tool: &dyn Tool,
        _args: &JsonMap,
        _ctx: &mut ToolContext,
        _error: &CadenceError,
    ) -> CadenceResult<Option<JsonMap>> {
        Ok(None)
    }
}

macro_rules! first_override {
    ($self:ident, $hook:literal, |$plugin:ident| $call:expr) => {{
        for $plugin in &$self.plugins {
            match $call.await {
                Ok(Some(value)) => {
                    debug!(plugin = %$plugin.name(), hook = $hook, "Plugin override");
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(e) => return Err(hook_failed($plugin.name(), $hook, e)),
            }
        }
        Ok(None)
    }};
}

fn hook_failed(plugin: &str, hook: &str, error: CadenceError) -> CadenceError {
    warn!(plugin = %plugin, hook = %hook, error = %error, "Plugin hook failed");
    error
}

/// Plugins in registration order.
///
/// Used both for the runner-wide pipeline and for agent-scoped callbacks.
#[derive(Clone, Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin. Names must be unique.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> CadenceResult<()> {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(CadenceError::Config(format!(
                "Plugin '{}' is already registered",
                plugin.name()
            )));
        }
        debug!(plugin = %plugin.name(), "Registered plugin");
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> CadenceResult<Self> {
        self.register(plugin)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn run_on_user_message(
        &self,
        ctx: &InvocationContext,
        message: &Content,
    ) -> CadenceResult<Option<Content>> {
        first_override!(self, "on_user_message", |p| p.on_user_message(ctx, message))
    }

    pub async fn run_before_run(&self, ctx: &InvocationContext) -> CadenceResult<Option<Content>> {
        first_override!(self, "before_run", |p| p.before_run(ctx))
    }

    pub async fn run_on_event(
        &self,
        ctx: &InvocationContext,
        event: &Event,
    ) -> CadenceResult<Option<Event>> {
        first_override!(self, "on_event", |p| p.on_event(ctx, event))
    }

    /// Calls every plugin's `after_run`; the first failure is returned.
    pub async fn run_after_run(&self, ctx: &InvocationContext) -> CadenceResult<()> {
        for plugin in &self.plugins {
            plugin
                .after_run(ctx)
                .await
                .map_err(|e| hook_failed(plugin.name(), "after_run", e))?;
        }
        Ok(())
    }

    pub async fn run_before_agent(
        &self,
        ctx: &mut CallbackContext<'_>,
    ) -> CadenceResult<Option<Content>> {
        first_override!(self, "before_agent", |p| p.before_agent(ctx))
    }

    pub async fn run_after_agent(
        &self,
        ctx: &mut CallbackContext<'_>,
    ) -> CadenceResult<Option<Content>> {
        first_override!(self, "after_agent", |p| p.after_agent(ctx))
    }

    pub async fn run_before_model(
        &self,
        ctx: &mut CallbackContext<'_>,
        request: &mut LlmRequest,
    ) -> CadenceResult<Option<LlmResponse>> {
        first_override!(self, "before_model", |p| p.before_model(ctx, request))
    }

    pub async fn run_after_model(
        &self,
        ctx: &mut CallbackContext<'_>,
        response: &LlmResponse,
    ) -> CadenceResult<Option<LlmResponse>> {
        first_override!(self, "after_model", |p| p.after_model(ctx, response))
    }

    pub async fn run_on_model_error(
        &self,
        ctx: &mut CallbackContext<'_>,
        request: &LlmRequest,
        error: &CadenceError,
    ) -> CadenceResult<Option<LlmResponse>> {
        first_override!(self, "on_model_error", |p| p.on_model_error(ctx, request, error))
    }

    pub async fn run_before_tool(
        &self,
        tool: &dyn Tool,
        args: &JsonMap,
        ctx: &mut ToolContext,
    ) -> CadenceResult<Option<JsonMap>> {
        first_override!(self, "before_tool", |p| p.before_tool(tool, args, ctx))
    }

    pub async fn run_after_tool(
        &self,
        tool: &dyn Tool,
        args: &JsonMap,
        ctx: &mut ToolContext,
        result: &JsonMap,
    ) -> CadenceResult<Option<JsonMap>> {
        first_override!(self, "after_tool", |p| p.after_tool(tool, args, ctx, result))
    }

    pub async fn run_on_tool_error(
        &self,
        tool: &dyn Tool,
        args: &JsonMap,
        ctx: &mut ToolContext,
        error: &CadenceError,
    ) -> CadenceResult<Option<JsonMap>> {
        first_override!(self, "on_tool_error", |p| p.on_tool_error(tool, args, ctx, error))
    }
}
