//! MCP (Model Context Protocol) Service and Tool Factory.
//!
//! Holds one persistent `rmcp` session per configured server (stdio, HTTP,
//! or SSE transport) for the process lifetime, and adapts MCP tool
//! descriptors into the orchestrator's `ToolDefinition` shape.

mod service;
mod session;
mod types;

pub use service::{McpService, SharedMcpService};
pub use types::{McpTool, ToolDefinition};
