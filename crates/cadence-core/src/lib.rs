//! Core types and error definitions for the Cadence agent runtime.
//!
//! This crate provides the foundational types shared across all Cadence crates:
//! the error taxonomy, conversation content, the immutable [`Event`] record and
//! the state-delta folding rules that make a session's state derivable from its
//! event log.
//!
//! # Main types
//!
//! - [`CadenceError`]: Unified error enum for all Cadence subsystems.
//! - [`CadenceResult`]: Convenience alias for `Result<T, CadenceError>`.
//! - [`Content`] / [`Part`]: Role-tagged, ordered message parts.
//! - [`Event`]: One causal step recorded in a session.
//! - [`EventActions`]: Side effects (state delta, transfer, escalation) attached to an event.
//! - [`StateMap`]: Materialized session state.

/// Conversation content: roles, parts, function calls and responses.
pub mod content;
/// Events and their side-effect payloads.
pub mod event;
/// State maps and delta folding.
pub mod state;

pub use content::{
    Blob, Content, FileData, FunctionCall, FunctionResponse, Part, ROLE_MODEL, ROLE_USER,
};
pub use event::{Event, EventActions, ToolConfirmation};
pub use state::{apply_delta, fold_events, strip_temp_keys, StateMap, TEMP_PREFIX};

// --- Error types ---

/// Top-level error type for the Cadence runtime.
///
/// Each variant corresponds to one class of failure. Only model-call and
/// tool-execution failures may be recovered by the plugin error hooks; see
/// [`CadenceError::is_plugin_interceptable`].
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    /// The model call failed (network, quota, malformed response).
    #[error("Model call error: {0}")]
    ModelCall(String),

    /// The invocation exceeded its configured number of model calls.
    #[error("Max number of model calls exceeded: limit {limit}")]
    ModelCallLimit {
        /// The configured limit.
        limit: u32,
    },

    /// A tool raised an error or returned an invalid result.
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution {
        /// Name of the failing tool.
        tool: String,
        /// Failure description.
        message: String,
    },

    /// The model requested a tool the agent does not declare.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool discovery from a remote provider exhausted its retries.
    #[error("Failed to load tools after {attempts} attempts: {message}")]
    ToolLoading {
        /// Number of discovery attempts made.
        attempts: u32,
        /// Error from the last attempt.
        message: String,
    },

    /// The requested session does not exist.
    #[error("Session not found: {app_name}/{user_id}/{session_id}")]
    SessionNotFound {
        /// Application name.
        app_name: String,
        /// User id.
        user_id: String,
        /// Session id.
        session_id: String,
    },

    /// An append was attempted on a session copy that is behind the store.
    #[error("Stale session {session_id}: stored copy has {stored} events, caller has {in_hand}")]
    StaleSession {
        /// Session id.
        session_id: String,
        /// Events in the store.
        stored: usize,
        /// Events in the caller's copy.
        in_hand: usize,
    },

    /// Any other session persistence failure.
    #[error("Session error: {0}")]
    Session(String),

    /// A plugin or callback signalled failure.
    #[error("Plugin '{plugin}' failed: {message}")]
    Plugin {
        /// Name of the failing plugin.
        plugin: String,
        /// Failure description.
        message: String,
    },

    /// An error originating from agent execution or agent-graph assembly.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadenceError {
    /// Whether this error may be passed to a plugin error hook for recovery.
    ///
    /// Session-store errors and tool-discovery exhaustion always propagate.
    pub fn is_plugin_interceptable(&self) -> bool {
        matches!(
            self,
            CadenceError::ModelCall(_)
                | CadenceError::Http(_)
                | CadenceError::ToolExecution { .. }
        )
    }

    /// Shorthand for a [`CadenceError::ToolExecution`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        CadenceError::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`CadenceError::Plugin`].
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        CadenceError::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// A convenience `Result` alias using [`CadenceError`].
pub type CadenceResult<T> = Result<T, CadenceError>;
