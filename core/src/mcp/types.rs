//! MCP type definitions shared across transports and the tool factory.

use serde::Serialize;
use serde_json::Value;

/// A tool descriptor fetched from an MCP server's `list_tools` RPC.
#[derive(Debug, Clone, Serialize)]
pub struct McpTool {
    pub server: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// A tool definition in the shape the chat orchestrator consumes, bound to
/// the server/tool name pair the invoking callable needs to route a call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
    pub server: String,
    pub mcp_tool_name: String,
}

impl From<McpTool> for ToolDefinition {
    fn from(tool: McpTool) -> Self {
        Self {
            name: format!("{}__{}", tool.server, tool.name),
            description: tool.description,
            parameters: tool.input_schema.unwrap_or_else(|| serde_json::json!({})),
            server: tool.server,
            mcp_tool_name: tool.name,
        }
    }
}
