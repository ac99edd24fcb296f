//! The top-level run orchestration and live input queue.

use crate::agent::{run_agent, AgentId, AgentTree};
use crate::config::{RunConfig, RunnerConfig};
use crate::context::{EventSender, InvocationContext};
use crate::flow::USER_AUTHOR;
use crate::plugin::PluginManager;
use cadence_core::{CadenceError, CadenceResult, Content, Event, StateMap};
use cadence_session::{Session, SessionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Events of one run, in production order. A failed run ends with one `Err`.
pub type EventStream = ReceiverStream<CadenceResult<Event>>;

/// Author of events produced by a `before_run` override.
pub const MODEL_AUTHOR: &str = "model";

/// Error code of the event substituted for a timed-out execution.
pub const EXECUTION_TIMEOUT: &str = "EXECUTION_TIMEOUT";

const EVENT_CHANNEL_CAPACITY: usize = 64;

enum LiveRequest {
    Content(Content),
    Close,
}

/// Sending half of a live session's input. Cheap to clone.
#[derive(Clone)]
pub struct LiveRequestQueue {
    tx: mpsc::UnboundedSender<LiveRequest>,
}

/// Receiving half of a [`LiveRequestQueue`], consumed by [`Runner::run_live`].
pub struct LiveRequests {
    rx: mpsc::UnboundedReceiver<LiveRequest>,
}

impl LiveRequestQueue {
    pub fn channel() -> (Self, LiveRequests) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, LiveRequests { rx })
    }

    /// Queues one user message. Fails once the live run has ended.
    pub fn send_content(&self, content: Content) -> CadenceResult<()> {
        self.tx
            .send(LiveRequest::Content(content))
            .map_err(|_| CadenceError::Agent("Live run has ended".into()))
    }

    /// Ends the live run after the messages already queued.
    pub fn close(&self) {
        let _ = self.tx.send(LiveRequest::Close);
    }
}

impl LiveRequests {
    async fn next(&mut self) -> Option<Content> {
        match self.rx.recv().await? {
            LiveRequest::Content(content) => Some(content),
            LiveRequest::Close => None,
        }
    }
}

/// Top-level entry point: loads the session, runs the plugin pipeline around
/// the agent tree, and streams the resulting events.
#[derive(Clone)]
pub struct Runner {
    app_name: String,
    agents: Arc<AgentTree>,
    store: Arc<dyn SessionStore>,
    plugins: Arc<PluginManager>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(app_name: impl Into<String>, agents: AgentTree, store: Arc<dyn SessionStore>) -> Self {
        Self {
            app_name: app_name.into(),
            agents: Arc::new(agents),
            store,
            plugins: Arc::new(PluginManager::new()),
            config: RunnerConfig::default(),
        }
    }

    pub fn with_plugins(mut self, plugins: PluginManager) -> Self {
        self.plugins = Arc::new(plugins);
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn agents(&self) -> &AgentTree {
        &self.agents
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Runs one turn for `new_message`.
    ///
    /// `state_delta` is attached to the recorded user-message event. The user
    /// event itself is recorded but not yielded.
    pub fn run(
        &self,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        new_message: Content,
        state_delta: Option<StateMap>,
        run_config: RunConfig,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let runner = self.clone();
        let user_id = user_id.into();
        let session_id = session_id.into();
        tokio::spawn(async move {
            let Some(mut ctx) = runner.open(&user_id, &session_id, run_config, &tx).await else {
                return;
            };
            info!(
                app = %runner.app_name,
                session_id = %session_id,
                invocation_id = %ctx.invocation_id,
                "Run started"
            );
            let result = runner.invoke(&mut ctx, new_message, state_delta).await;
            runner.finish(&ctx, result).await;
        });
        ReceiverStream::new(rx)
    }

    /// Runs one turn per queued message until the queue is closed.
    pub fn run_live(
        &self,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        requests: LiveRequests,
        run_config: RunConfig,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let runner = self.clone();
        let user_id = user_id.into();
        let session_id = session_id.into();
        tokio::spawn(async move {
            let Some(mut ctx) = runner.open(&user_id, &session_id, run_config, &tx).await else {
                return;
            };
            info!(
                app = %runner.app_name,
                session_id = %session_id,
                invocation_id = %ctx.invocation_id,
                "Live run started"
            );
            let result = runner.invoke_live(&mut ctx, requests).await;
            runner.finish(&ctx, result).await;
        });
        ReceiverStream::new(rx)
    }

    async fn load_session(&self, user_id: &str, session_id: &str) -> CadenceResult<Session> {
        let existing = self
            .store
            .get_session(&self.app_name, user_id, session_id, None)
            .await?;
        match existing {
            Some(session) => Ok(session),
            None if self.config.auto_create_session => {
                debug!(session_id = %session_id, "Creating session on first use");
                self.store
                    .create_session(&self.app_name, user_id, None, Some(session_id.to_string()))
                    .await
            }
            None => Err(CadenceError::SessionNotFound {
                app_name: self.app_name.clone(),
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Loads the session and builds the invocation. A failure is sent to the
    /// caller directly; no plugin runs.
    async fn open(
        &self,
        user_id: &str,
        session_id: &str,
        run_config: RunConfig,
        tx: &EventSender,
    ) -> Option<InvocationContext> {
        match self.load_session(user_id, session_id).await {
            Ok(session) => Some(InvocationContext::new(
                session,
                self.store.clone(),
                self.plugins.clone(),
                self.agents.clone(),
                run_config.normalized(),
                None,
                tx.clone(),
            )),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to load session");
                let _ = tx.send(Err(e)).await;
                None
            }
        }
    }

    /// Runs `after_run` and reports the outcome. An `after_run` failure
    /// replaces the run's own result.
    async fn finish(&self, ctx: &InvocationContext, result: CadenceResult<()>) {
        let result = self.plugins.run_after_run(ctx).await.and(result);
        match result {
            Ok(()) => info!(invocation_id = %ctx.invocation_id, llm_calls = ctx.llm_call_count(), "Run completed"),
            Err(e) => {
                error!(invocation_id = %ctx.invocation_id, error = %e, "Run failed");
                ctx.send_error(e).await;
            }
        }
    }

    /// Emits a `before_run` override as the run's only event.
    async fn emit_override(&self, ctx: &InvocationContext, content: Content) -> CadenceResult<()> {
        debug!(invocation_id = %ctx.invocation_id, "Run short-circuited by before_run");
        let mut event = Event::new(&ctx.invocation_id, MODEL_AUTHOR).with_content(content);
        event.final_response = true;
        ctx.emit(event).await
    }

    async fn record_user_message(
        &self,
        ctx: &InvocationContext,
        message: &Content,
        state_delta: Option<StateMap>,
    ) -> CadenceResult<()> {
        if message.parts.is_empty() {
            return Err(CadenceError::Agent("New message has no parts".into()));
        }
        let mut event = Event::new(&ctx.invocation_id, USER_AUTHOR).with_content(message.clone());
        event.actions.state_delta = state_delta.unwrap_or_default();
        ctx.append(event).await?;
        Ok(())
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        message: Content,
        state_delta: Option<StateMap>,
    ) -> CadenceResult<()> {
        if let Some(content) = self.plugins.run_before_run(ctx).await? {
            self.record_user_message(ctx, &message, state_delta).await?;
            return self.emit_override(ctx, content).await;
        }
        let message = self
            .plugins
            .run_on_user_message(ctx, &message)
            .await?
            .unwrap_or(message);
        self.record_user_message(ctx, &message, state_delta).await?;
        ctx.user_content = Some(message);

        let agent = self.select_agent(ctx).await;
        self.execute(ctx, agent).await
    }

    async fn invoke_live(
        &self,
        ctx: &mut InvocationContext,
        mut requests: LiveRequests,
    ) -> CadenceResult<()> {
        if let Some(content) = self.plugins.run_before_run(ctx).await? {
            return self.emit_override(ctx, content).await;
        }
        while let Some(message) = requests.next().await {
            let message = self
                .plugins
                .run_on_user_message(ctx, &message)
                .await?
                .unwrap_or(message);
            self.record_user_message(ctx, &message, None).await?;
            ctx.user_content = Some(message);

            let agent = self.select_agent(ctx).await;
            self.execute(ctx, agent).await?;
            if ctx.is_ended() {
                break;
            }

            let mut marker = Event::new(&ctx.invocation_id, ctx.active_agent().await);
            marker.turn_complete = true;
            ctx.emit_transient(marker).await?;
        }
        debug!(invocation_id = %ctx.invocation_id, "Live input closed");
        Ok(())
    }

    /// Picks the agent that continues the conversation: the author of the
    /// latest agent event when control may return to it, else the root.
    async fn select_agent(&self, ctx: &InvocationContext) -> AgentId {
        let root = self.agents.root();
        let root_name = &self.agents.node(root).name;
        let events = ctx.events().await;
        for event in events.iter().rev().filter(|e| e.author != USER_AUTHOR) {
            if &event.author == root_name {
                return root;
            }
            match self.agents.find(&event.author) {
                Some(id) if self.agents.is_resumable(id) => return id,
                Some(_) => {}
                None => debug!(author = %event.author, "Event author is not an agent of this tree"),
            }
        }
        root
    }

    /// Runs the agent under the configured timeout. A timeout is reported as
    /// a final event from the agent that was executing, not as an error.
    async fn execute(&self, ctx: &InvocationContext, agent: AgentId) -> CadenceResult<()> {
        let run = run_agent(ctx.clone(), agent);
        let Some(secs) = self.config.execution_timeout_secs else {
            return run.await.map(|_| ());
        };
        match tokio::time::timeout(Duration::from_secs(secs), run).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                let author = ctx.active_agent().await;
                warn!(invocation_id = %ctx.invocation_id, agent = %author, timeout_secs = secs, "Execution timed out");
                let mut event = Event::new(&ctx.invocation_id, author)
                    .with_branch(ctx.branch.clone())
                    .with_content(Content::model_text(format!(
                        "Execution timed out after {secs} seconds."
                    )));
                event.error_code = Some(EXECUTION_TIMEOUT.to_string());
                event.error_message = Some(format!("Execution exceeded {secs}s"));
                event.turn_complete = true;
                event.final_response = true;
                ctx.emit(event).await
            }
        }
    }
}
