//! Agent execution for the Cadence runtime.
//!
//! [`Runner`] loads a session, runs the [`PluginManager`] pipeline around an
//! [`AgentTree`], and streams every [`Event`](cadence_core::Event) the agents
//! produce. LLM agents run the tool-calling step loop in [`flow`]; streamed
//! model output is shaped by [`StreamingResponseAggregator`].
//!
//! # Main types
//!
//! - [`Runner`]: top-level orchestration, timeout handling and live mode.
//! - [`AgentTree`] / [`AgentDef`] / [`LlmAgent`]: the agent graph.
//! - [`Plugin`] / [`PluginManager`]: first-override-wins hook pipeline.
//! - [`LlmBackend`]: model transport; [`backends::OpenAiBackend`] is bundled.
//! - [`ComponentRegistry`]: string-keyed factories for assembly code.
//! - [`testing`]: scripted model and recording plugin.

pub mod agent;
pub mod backends;
pub mod config;
pub mod context;
pub mod flow;
pub mod llm;
pub mod plugin;
pub mod registry;
pub mod runner;
pub mod stream;
pub mod testing;

pub use agent::{
    run_agent, AgentDef, AgentId, AgentKind, AgentNode, AgentTree, IncludeContents, Instruction,
    LlmAgent, TurnOutcome,
};
pub use config::{AudioTranscriptionConfig, Modality, ModelConfig, RunConfig, RunnerConfig, StreamingMode};
pub use context::InvocationContext;
pub use llm::{ChunkReceiver, FinishReason, LlmBackend, LlmRequest, LlmResponse, ModelChunk, UsageMetadata};
pub use plugin::{CallbackContext, JsonMap, Plugin, PluginManager};
pub use registry::ComponentRegistry;
pub use runner::{EventStream, LiveRequestQueue, LiveRequests, Runner, EXECUTION_TIMEOUT};
pub use stream::StreamingResponseAggregator;
