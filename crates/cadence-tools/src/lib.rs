//! Tool abstractions for the Cadence runtime.
//!
//! - [`Tool`]: a callable capability with a declared schema.
//! - [`ToolContext`]: per-call state view and side-effect recorder.
//! - [`FunctionTool`]: wraps a Rust closure as a tool.
//! - [`ToolRegistry`]: an agent's ordered tool set.
//! - [`Toolset`] / [`ToolFilter`] / [`retry_discovery`]: tools resolved from a
//!   remote provider, with the three-attempt discovery contract.
//! - [`builtins`]: `transfer_to_agent`, `exit_loop`, `echo`.

pub mod builtins;
pub mod function;
pub mod registry;
pub mod tool;
pub mod toolset;

pub use builtins::{EchoTool, ExitLoopTool, TransferToAgentTool, EXIT_LOOP, TRANSFER_TO_AGENT};
pub use function::FunctionTool;
pub use registry::ToolRegistry;
pub use tool::{into_response_map, Tool, ToolContext, ToolDeclaration};
pub use toolset::{retry_discovery, ToolFilter, Toolset, DISCOVERY_ATTEMPTS};
