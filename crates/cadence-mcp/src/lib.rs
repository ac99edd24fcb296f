//! Remote tool provider support for the Cadence runtime.
//!
//! A stdio tool server is spawned as a subprocess and spoken to over
//! newline-delimited JSON-RPC 2.0 (`initialize`, `tools/list`, `tools/call`).
//! [`McpToolset`] exposes its tools to agents with retried discovery.

pub mod client;
pub mod protocol;
pub mod toolset;

pub use client::{McpClient, StdioServerConfig, ToolProvider};
pub use protocol::{McpContent, McpToolDef, McpToolResult};
pub use toolset::{McpConnector, McpTool, McpToolset, StdioConnector};
