//! Shared utilities used by `llamafarm-core`: tracing init and MCP-facing
//! error conversion.

pub mod error;
pub mod init;

pub use error::{internal_error, invalid_params, IntoMcpError, McpResult, ResultExt};
pub use init::init_tracing;

pub use rmcp::ErrorData as McpError;
