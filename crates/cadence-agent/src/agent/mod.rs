//! The agent graph and its dispatcher.
//!
//! Agents live in an arena ([`AgentTree`]) and refer to their parent and
//! children by [`AgentId`]. Behaviour is a closed set of variants
//! ([`AgentKind`]); [`run_agent`] runs the agent-level hooks and dispatches on
//! the variant.

pub mod llm_agent;

pub use llm_agent::{IncludeContents, Instruction, InstructionProvider, LlmAgent};

use crate::context::InvocationContext;
use crate::flow;
use crate::plugin::{CallbackContext, Plugin, PluginManager};
use cadence_core::{CadenceError, CadenceResult, Content, Event, EventActions};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Index of an agent in its [`AgentTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentId(usize);

/// What an agent does when it runs.
#[derive(Debug, Clone)]
pub enum AgentKind {
    /// Drives a model through the tool-calling step loop.
    Llm(LlmAgent),
    /// Runs its children once, in order.
    Sequential,
    /// Runs its children concurrently, each on its own branch.
    Parallel,
    /// Runs its children in order, repeatedly, until an escalation or the
    /// iteration cap.
    Loop { max_iterations: Option<u32> },
}

impl AgentKind {
    pub fn as_llm(&self) -> Option<&LlmAgent> {
        match self {
            Self::Llm(agent) => Some(agent),
            _ => None,
        }
    }
}

/// One agent in the arena.
pub struct AgentNode {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    pub kind: AgentKind,
    /// Agent-scoped hooks, run after the runner-wide plugins.
    pub callbacks: PluginManager,
    pub parent: Option<AgentId>,
    pub children: Vec<AgentId>,
}

/// Nested description of an agent graph, flattened by [`AgentTree::build`].
pub struct AgentDef {
    name: String,
    description: String,
    kind: AgentKind,
    callbacks: Vec<Arc<dyn Plugin>>,
    sub_agents: Vec<AgentDef>,
}

impl AgentDef {
    pub fn llm(agent: LlmAgent) -> Self {
        Self {
            name: agent.name.clone(),
            description: agent.description.clone(),
            kind: AgentKind::Llm(agent),
            callbacks: Vec::new(),
            sub_agents: Vec::new(),
        }
    }

    pub fn sequential(name: impl Into<String>) -> Self {
        Self::workflow(name, AgentKind::Sequential)
    }

    pub fn parallel(name: impl Into<String>) -> Self {
        Self::workflow(name, AgentKind::Parallel)
    }

    pub fn loop_agent(name: impl Into<String>, max_iterations: Option<u32>) -> Self {
        Self::workflow(name, AgentKind::Loop { max_iterations })
    }

    fn workflow(name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            callbacks: Vec::new(),
            sub_agents: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn Plugin>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_sub_agent(mut self, sub_agent: AgentDef) -> Self {
        self.sub_agents.push(sub_agent);
        self
    }
}

/// Arena of agents with index-based parent/child links.
pub struct AgentTree {
    nodes: Vec<AgentNode>,
    by_name: HashMap<String, AgentId>,
    root: AgentId,
}

impl AgentTree {
    /// Flattens `root` and its sub-agents. Agent names must be unique.
    pub fn build(root: AgentDef) -> CadenceResult<Self> {
        let mut tree = Self {
            nodes: Vec::new(),
            by_name: HashMap::new(),
            root: AgentId(0),
        };
        tree.root = tree.insert(root, None)?;
        info!(root = %tree.node(tree.root).name, agents = tree.nodes.len(), "Built agent tree");
        Ok(tree)
    }

    fn insert(&mut self, def: AgentDef, parent: Option<AgentId>) -> CadenceResult<AgentId> {
        if def.name.is_empty() || def.name == "user" {
            return Err(CadenceError::Config(format!(
                "Invalid agent name '{}'",
                def.name
            )));
        }
        if self.by_name.contains_key(&def.name) {
            return Err(CadenceError::Config(format!(
                "Duplicate agent name '{}'",
                def.name
            )));
        }

        let mut callbacks = PluginManager::new();
        for callback in def.callbacks {
            callbacks.register(callback)?;
        }

        let id = AgentId(self.nodes.len());
        self.by_name.insert(def.name.clone(), id);
        self.nodes.push(AgentNode {
            id,
            name: def.name,
            description: def.description,
            kind: def.kind,
            callbacks,
            parent,
            children: Vec::new(),
        });

        for sub in def.sub_agents {
            let child = self.insert(sub, Some(id))?;
            self.nodes[id.0].children.push(child);
        }
        Ok(id)
    }

    pub fn root(&self) -> AgentId {
        self.root
    }

    /// The node for an id issued by this tree.
    pub fn node(&self, id: AgentId) -> &AgentNode {
        &self.nodes[id.0]
    }

    pub fn find(&self, name: &str) -> Option<AgentId> {
        self.by_name.get(name).copied()
    }

    pub fn parent(&self, id: AgentId) -> Option<AgentId> {
        self.node(id).parent
    }

    pub fn children(&self, id: AgentId) -> &[AgentId] {
        &self.node(id).children
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Agents an LLM agent may hand control to: its children, then its parent
    /// and peers when the parent is itself an LLM agent and transfer is allowed.
    pub fn transfer_targets(&self, id: AgentId) -> Vec<AgentId> {
        let node = self.node(id);
        let Some(agent) = node.kind.as_llm() else {
            return Vec::new();
        };
        let mut targets = node.children.clone();
        let Some(parent) = node.parent else {
            return targets;
        };
        if self.node(parent).kind.as_llm().is_none() {
            return targets;
        }
        if !agent.disallow_transfer_to_parent {
            targets.push(parent);
        }
        if !agent.disallow_transfer_to_peers {
            targets.extend(self.children(parent).iter().filter(|&&peer| peer != id));
        }
        targets
    }

    /// Whether control may come back to `id` on a later run: it and every
    /// ancestor are LLM agents that allow transfer to their parent.
    pub fn is_resumable(&self, id: AgentId) -> bool {
        let mut current = Some(id);
        while let Some(cur) = current {
            match self.node(cur).kind.as_llm() {
                Some(agent) if !agent.disallow_transfer_to_parent => current = self.parent(cur),
                _ => return false,
            }
        }
        true
    }
}

/// Result of running one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// An event of this run asked to leave the enclosing loop.
    pub escalated: bool,
}

/// A new event authored by `author` on the context's branch.
pub(crate) fn new_event(ctx: &InvocationContext, author: &str) -> Event {
    Event::new(&ctx.invocation_id, author).with_branch(ctx.branch.clone())
}

async fn emit_agent_content(
    ctx: &InvocationContext,
    node: &AgentNode,
    content: Option<Content>,
    actions: EventActions,
) -> CadenceResult<()> {
    if content.is_none() && actions.is_empty() {
        return Ok(());
    }
    let mut event = new_event(ctx, &node.name).with_actions(actions);
    if let Some(content) = content {
        event = event.with_content(content);
        event.final_response = true;
    }
    ctx.emit(event).await
}

/// Runs an agent and, depending on its kind, its descendants.
pub fn run_agent(ctx: InvocationContext, id: AgentId) -> BoxFuture<'static, CadenceResult<TurnOutcome>> {
    async move {
        let agents = ctx.agents.clone();
        let node = agents.node(id);
        ctx.set_active_agent(&node.name).await;
        debug!(invocation_id = %ctx.invocation_id, agent = %node.name, "Running agent");

        let state = ctx.state_snapshot().await;
        let mut cb = CallbackContext::new(&ctx, &node.name, state);
        let mut skipped = ctx.plugins.run_before_agent(&mut cb).await?;
        if skipped.is_none() {
            skipped = node.callbacks.run_before_agent(&mut cb).await?;
        }
        let actions = cb.take_actions();
        if let Some(content) = skipped {
            emit_agent_content(&ctx, node, Some(content), actions).await?;
            return Ok(TurnOutcome::default());
        }
        // An LLM agent carries callback writes on its first event of the turn.
        let carried = if matches!(node.kind, AgentKind::Llm(_)) {
            actions
        } else {
            emit_agent_content(&ctx, node, None, actions).await?;
            EventActions::default()
        };

        let outcome = match &node.kind {
            AgentKind::Llm(_) => flow::run_llm_agent(&ctx, id, carried).await?,
            AgentKind::Sequential => run_sequential(&ctx, node).await?,
            AgentKind::Parallel => run_parallel(&ctx, node).await?,
            AgentKind::Loop { max_iterations } => run_loop(&ctx, node, *max_iterations).await?,
        };

        if ctx.is_ended() {
            return Ok(outcome);
        }

        let state = ctx.state_snapshot().await;
        let mut cb = CallbackContext::new(&ctx, &node.name, state);
        let mut extra = ctx.plugins.run_after_agent(&mut cb).await?;
        if extra.is_none() {
            extra = node.callbacks.run_after_agent(&mut cb).await?;
        }
        let actions = cb.take_actions();
        emit_agent_content(&ctx, node, extra, actions).await?;
        Ok(outcome)
    }
    .boxed()
}

async fn run_sequential(ctx: &InvocationContext, node: &AgentNode) -> CadenceResult<TurnOutcome> {
    let mut outcome = TurnOutcome::default();
    for &child in &node.children {
        if ctx.is_ended() {
            break;
        }
        outcome.escalated |= run_agent(ctx.clone(), child).await?.escalated;
    }
    Ok(outcome)
}

async fn run_parallel(ctx: &InvocationContext, node: &AgentNode) -> CadenceResult<TurnOutcome> {
    let parent_branch = ctx.branch.clone().unwrap_or_else(|| node.name.clone());
    let runs = node.children.iter().map(|&child| {
        let branch = format!("{parent_branch}.{}", ctx.agents.node(child).name);
        run_agent(ctx.with_branch(Some(branch)), child)
    });

    let mut outcome = TurnOutcome::default();
    for result in join_all(runs).await {
        outcome.escalated |= result?.escalated;
    }
    Ok(outcome)
}

async fn run_loop(
    ctx: &InvocationContext,
    node: &AgentNode,
    max_iterations: Option<u32>,
) -> CadenceResult<TurnOutcome> {
    if node.children.is_empty() {
        return Ok(TurnOutcome::default());
    }
    let mut iteration = 0;
    while max_iterations.map_or(true, |max| iteration < max) {
        for &child in &node.children {
            if ctx.is_ended() {
                return Ok(TurnOutcome::default());
            }
            if run_agent(ctx.clone(), child).await?.escalated {
                debug!(agent = %node.name, iteration, "Loop escalated");
                return Ok(TurnOutcome { escalated: true });
            }
        }
        iteration += 1;
    }
    Ok(TurnOutcome::default())
}
