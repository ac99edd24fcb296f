//! Deterministic doubles for driving the runtime in tests and demos.

use crate::context::InvocationContext;
use crate::llm::{ChunkReceiver, LlmBackend, LlmRequest, LlmResponse, ModelChunk};
use crate::plugin::{CallbackContext, JsonMap, Plugin};
use crate::runner::EventStream;
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, Content, Event};
use cadence_tools::{Tool, ToolContext};
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, Mutex};

/// One scripted model reply.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// A single response.
    Response(LlmResponse),
    /// Raw chunks, for streaming runs.
    Chunks(Vec<ModelChunk>),
    /// A failed call (`ModelCall` error).
    Error(String),
    /// A call that never completes.
    Hang,
}

/// An [`LlmBackend`] replaying a fixed script and recording every request.
pub struct ScriptedModel {
    name: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    repeat: Option<ScriptStep>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedModel {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            name: "scripted".to_string(),
            steps: Mutex::new(steps.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies with the given responses, in order.
    pub fn responses(responses: Vec<LlmResponse>) -> Self {
        Self::new(responses.into_iter().map(ScriptStep::Response).collect())
    }

    /// Replies with `step` on every call.
    pub fn repeating(step: ScriptStep) -> Self {
        Self {
            repeat: Some(step),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    async fn next_step(&self, request: &LlmRequest) -> CadenceResult<ScriptStep> {
        self.requests.lock().await.push(request.clone());
        if let Some(step) = self.steps.lock().await.pop_front() {
            return Ok(step);
        }
        self.repeat
            .clone()
            .ok_or_else(|| CadenceError::ModelCall("Model script exhausted".into()))
    }
}

#[async_trait]
impl LlmBackend for ScriptedModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &LlmRequest) -> CadenceResult<LlmResponse> {
        match self.next_step(request).await? {
            ScriptStep::Response(response) => Ok(response),
            ScriptStep::Chunks(_) => Err(CadenceError::ModelCall(
                "Chunked step requires a streaming run".into(),
            )),
            ScriptStep::Error(message) => Err(CadenceError::ModelCall(message)),
            ScriptStep::Hang => std::future::pending().await,
        }
    }

    async fn generate_stream(&self, request: &LlmRequest) -> CadenceResult<ChunkReceiver> {
        let chunks = match self.next_step(request).await? {
            ScriptStep::Response(response) => vec![ModelChunk::Response(response)],
            ScriptStep::Chunks(chunks) => chunks,
            ScriptStep::Error(message) => return Err(CadenceError::ModelCall(message)),
            ScriptStep::Hang => std::future::pending().await,
        };
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let _ = tx.send(Ok(chunk)).await;
        }
        Ok(rx)
    }
}

/// A plugin that counts hook calls and returns preset overrides.
#[derive(Default)]
pub struct RecordingPlugin {
    name: String,
    calls: Mutex<HashMap<&'static str, usize>>,
    failing_hook: Option<&'static str>,
    pub before_run: Option<Content>,
    pub on_user_message: Option<Content>,
    pub before_agent: Option<Content>,
    pub after_agent: Option<Content>,
    pub before_model: Option<LlmResponse>,
    pub after_model: Option<LlmResponse>,
    pub on_model_error: Option<LlmResponse>,
    pub before_tool: Option<JsonMap>,
    pub after_tool: Option<JsonMap>,
    pub on_tool_error: Option<JsonMap>,
    pub on_event: Option<Event>,
}

impl RecordingPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Makes `hook` fail with a `Plugin` error.
    pub fn failing_on(mut self, hook: &'static str) -> Self {
        self.failing_hook = Some(hook);
        self
    }

    /// Times `hook` has been called.
    pub async fn calls(&self, hook: &str) -> usize {
        self.calls.lock().await.get(hook).copied().unwrap_or(0)
    }

    async fn record(&self, hook: &'static str) -> CadenceResult<()> {
        *self.calls.lock().await.entry(hook).or_insert(0) += 1;
        if self.failing_hook == Some(hook) {
            return Err(CadenceError::plugin(&self.name, format!("{hook} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_user_message(
        &self,
        _ctx: &InvocationContext,
        _message: &Content,
    ) -> CadenceResult<Option<Content>> {
        self.record("on_user_message").await?;
        Ok(self.on_user_message.clone())
    }

    async fn before_run(&self, _ctx: &InvocationContext) -> CadenceResult<Option<Content>> {
        self.record("before_run").await?;
        Ok(self.before_run.clone())
    }

    async fn on_event(&self, _ctx: &InvocationContext, _event: &Event) -> CadenceResult<Option<Event>> {
        self.record("on_event").await?;
        Ok(self.on_event.clone())
    }

    async fn after_run(&self, _ctx: &InvocationContext) -> CadenceResult<()> {
        self.record("after_run").await
    }

    async fn before_agent(&self, _ctx: &mut CallbackContext<'_>) -> CadenceResult<Option<Content>> {
        self.record("before_agent").await?;
        Ok(self.before_agent.clone())
    }

    async fn after_agent(&self, _ctx: &mut CallbackContext<'_>) -> CadenceResult<Option<Content>> {
        self.record("after_agent").await?;
        Ok(self.after_agent.clone())
    }

    async fn before_model(
        &self,
        _ctx: &mut CallbackContext<'_>,
        _request: &mut LlmRequest,
    ) -> CadenceResult<Option<LlmResponse>> {
        self.record("before_model").await?;
        Ok(self.before_model.clone())
    }

    async fn after_model(
        &self,
        _ctx: &mut CallbackContext<'_>,
        _response: &LlmResponse,
    ) -> CadenceResult<Option<LlmResponse>> {
        self.record("after_model").await?;
        Ok(self.after_model.clone())
    }

    async fn on_model_error(
        &self,
        _ctx: &mut CallbackContext<'_>,
        _request: &LlmRequest,
        _error: &CadenceError,
    ) -> CadenceResult<Option<LlmResponse>> {
        self.record("on_model_error").await?;
        Ok(self.on_model_error.clone())
    }

    async fn before_tool(
        &self,
        _tool: &dyn Tool,
        _args: &JsonMap,
        _ctx: &mut ToolContext,
    ) -> CadenceResult<Option<JsonMap>> {
        self.record("before_tool").await?;
        Ok(self.before_tool.clone())
    }

    async fn after_tool(
        &self,
        _tool: &dyn Tool,
        _args: &JsonMap,
        _ctx: &mut ToolContext,
        _result: &JsonMap,
    ) -> CadenceResult<Option<JsonMap>> {
        self.record("after_tool").await?;
        Ok(self.after_tool.clone())
    }

    async fn on_tool_error(
        &self,
        _tool: &dyn Tool,
        _args: &JsonMap,
        _ctx: &mut ToolContext,
        _error: &CadenceError,
    ) -> CadenceResult<Option<JsonMap>> {
        self.record("on_tool_error").await?;
        Ok(self.on_tool_error.clone())
    }
}

/// Drains a run, returning its events and the terminal error, if any.
pub async fn collect_events(mut stream: EventStream) -> (Vec<Event>, Option<CadenceError>) {
    let mut events = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => events.push(event),
            Err(e) => return (events, Some(e)),
        }
    }
    (events, None)
}
