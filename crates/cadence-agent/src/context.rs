use crate::agent::AgentTree;
use crate::config::RunConfig;
use crate::plugin::PluginManager;
use cadence_core::{CadenceError, CadenceResult, Content, Event, StateMap, TEMP_PREFIX};
use cadence_session::{Session, SessionStore};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Sending half of a run's event stream.
pub type EventSender = mpsc::Sender<CadenceResult<Event>>;

struct Shared {
    end_invocation: AtomicBool,
    llm_calls: AtomicU32,
    temp_state: Mutex<StateMap>,
    active_agent: Mutex<String>,
}

/// Everything one runner call carries through its agents.
///
/// Cloning is cheap; clones share the session, counters and output channel.
/// Only `branch` differs between clones made for parallel sub-agents.
#[derive(Clone)]
pub struct InvocationContext {
    pub invocation_id: String,
    pub branch: Option<String>,
    pub user_content: Option<Content>,
    pub run_config: Arc<RunConfig>,
    pub session: Arc<Mutex<Session>>,
    pub store: Arc<dyn SessionStore>,
    pub plugins: Arc<PluginManager>,
    pub agents: Arc<AgentTree>,
    shared: Arc<Shared>,
    tx: EventSender,
}

impl InvocationContext {
    pub fn new(
        session: Session,
        store: Arc<dyn SessionStore>,
        plugins: Arc<PluginManager>,
        agents: Arc<AgentTree>,
        run_config: RunConfig,
        user_content: Option<Content>,
        tx: EventSender,
    ) -> Self {
        let root_name = agents.node(agents.root()).name.clone();
        Self {
            invocation_id: Self::new_invocation_id(),
            branch: None,
            user_content,
            run_config: Arc::new(run_config),
            session: Arc::new(Mutex::new(session)),
            store,
            plugins,
            agents,
            shared: Arc::new(Shared {
                end_invocation: AtomicBool::new(false),
                llm_calls: AtomicU32::new(0),
                temp_state: Mutex::new(StateMap::new()),
                active_agent: Mutex::new(root_name),
            }),
            tx,
        }
    }

    pub fn new_invocation_id() -> String {
        format!("e-{}", Uuid::new_v4())
    }

    /// A clone scoped to the given branch.
    pub fn with_branch(&self, branch: Option<String>) -> Self {
        Self {
            branch,
            ..self.clone()
        }
    }

    /// Requests that no further model or tool steps run in this invocation.
    pub fn end_invocation(&self) {
        self.shared.end_invocation.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.shared.end_invocation.load(Ordering::SeqCst)
    }

    /// Counts one model call, failing once the configured limit is exceeded.
    pub fn increment_llm_calls(&self) -> CadenceResult<()> {
        let count = self.shared.llm_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.run_config.max_llm_calls;
        if limit > 0 && count > limit {
            return Err(CadenceError::ModelCallLimit { limit });
        }
        Ok(())
    }

    pub fn llm_call_count(&self) -> u32 {
        self.shared.llm_calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn set_active_agent(&self, name: &str) {
        *self.shared.active_agent.lock().await = name.to_string();
    }

    /// Name of the agent currently executing.
    pub async fn active_agent(&self) -> String {
        self.shared.active_agent.lock().await.clone()
    }

    /// Session state overlaid with this invocation's `temp:` keys.
    pub async fn state_snapshot(&self) -> StateMap {
        let mut state = self.session.lock().await.state.clone();
        state.extend(self.shared.temp_state.lock().await.clone());
        state
    }

    /// Session events as currently recorded.
    pub async fn events(&self) -> Vec<Event> {
        self.session.lock().await.events.clone()
    }

    async fn remember_temp(&self, delta: &StateMap) {
        let mut temp = self.shared.temp_state.lock().await;
        for (key, value) in delta {
            if key.starts_with(TEMP_PREFIX) {
                temp.insert(key.clone(), value.clone());
            }
        }
    }

    /// Records an event in the session without yielding it to the caller.
    pub(crate) async fn append(&self, event: Event) -> CadenceResult<Event> {
        self.remember_temp(&event.actions.state_delta).await;
        let mut session = self.session.lock().await;
        self.store.append_event(&mut session, event).await
    }

    /// Records a non-partial event, runs `on_event` plugins, and yields the
    /// (possibly overridden) event to the caller.
    ///
    /// A dropped receiver ends the invocation.
    pub async fn emit(&self, event: Event) -> CadenceResult<()> {
        let recorded = if event.partial {
            event
        } else {
            self.append(event).await?
        };
        self.deliver(recorded).await
    }

    /// Yields an event to the caller without recording it.
    pub(crate) async fn emit_transient(&self, event: Event) -> CadenceResult<()> {
        self.deliver(event).await
    }

    async fn deliver(&self, event: Event) -> CadenceResult<()> {
        let yielded = self
            .plugins
            .run_on_event(self, &event)
            .await?
            .unwrap_or(event);
        if self.tx.send(Ok(yielded)).await.is_err() {
            debug!(invocation_id = %self.invocation_id, "Event receiver dropped, ending invocation");
            self.end_invocation();
        }
        Ok(())
    }

    /// Sends a terminal error to the caller.
    pub(crate) async fn send_error(&self, error: CadenceError) {
        let _ = self.tx.send(Err(error)).await;
    }
}
