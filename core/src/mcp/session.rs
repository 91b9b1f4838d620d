//! One persistent `rmcp` session per configured server. Opened once on
//! first use and kept alive for the process lifetime, instead of
//! spawning a fresh client connection per tool call.

use rmcp::model::{CallToolRequestParam, CallToolResult, ClientCapabilities, ClientInfo, Implementation};
use rmcp::service::RunningService;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tokio::process::Command;

use crate::config::{McpServerConfig, McpTransport};
use crate::error::{AppError, AppResult};
use super::types::McpTool;

fn client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "llamafarmd".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

fn stdio_command(config: &McpServerConfig) -> AppResult<Command> {
    let command = config
        .command
        .as_ref()
        .ok_or_else(|| AppError::Validation(format!("mcp server '{}': missing stdio command", config.name)))?;
    let mut cmd = Command::new(command);
    if !config.args.is_empty() {
        cmd.args(&config.args);
    }
    for (key, value) in &config.env {
        let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
        cmd.env(key, expanded.as_ref());
    }
    Ok(cmd)
}

/// One live `rmcp` connection, held open for the process lifetime.
pub struct PersistentSession {
    service: RunningService<RoleClient, ()>,
    tools_cache: Option<Vec<McpTool>>,
}

impl PersistentSession {
    /// Opens a session for `config` per its configured transport.
    /// Configuration invariants (`command` present for stdio, `base_url`
    /// present for http/sse) are validated by [`McpServerConfig::validate`]
    /// before this is reached, but are re-checked here defensively since a
    /// failed open must not leave partially-initialized state behind.
    pub async fn open(config: &McpServerConfig) -> AppResult<Self> {
        config.validate()?;
        let service = match config.transport {
            McpTransport::Stdio => {
                let cmd = stdio_command(config)?;
                let transport = TokioChildProcess::new(cmd)
                    .map_err(|e| AppError::Transient(format!("mcp server '{}': spawn failed: {e}", config.name)))?;
                client_info()
                    .serve(transport)
                    .await
                    .map_err(|e| AppError::Transient(format!("mcp server '{}': session init failed: {e}", config.name)))?
            }
            McpTransport::Http => {
                let base_url = config.base_url.as_ref().ok_or_else(|| {
                    AppError::Validation(format!("mcp server '{}': missing base_url", config.name))
                })?;
                let transport = StreamableHttpClientTransport::from_uri(base_url.clone());
                client_info()
                    .serve(transport)
                    .await
                    .map_err(|e| AppError::Transient(format!("mcp server '{}': session init failed: {e}", config.name)))?
            }
            McpTransport::Sse => {
                let base_url = config.base_url.as_ref().ok_or_else(|| {
                    AppError::Validation(format!("mcp server '{}': missing base_url", config.name))
                })?;
                let transport = rmcp::transport::SseClientTransport::start(base_url.clone())
                    .await
                    .map_err(|e| AppError::Transient(format!("mcp server '{}': sse connect failed: {e}", config.name)))?;
                client_info()
                    .serve(transport)
                    .await
                    .map_err(|e| AppError::Transient(format!("mcp server '{}': session init failed: {e}", config.name)))?
            }
        };

        Ok(Self {
            service,
            tools_cache: None,
        })
    }

    /// Returns the cached tool list, fetching and caching on first call.
    /// The cache is invalidated only by closing and reopening the session.
    pub async fn list_tools(&mut self, server_name: &str) -> AppResult<Vec<McpTool>> {
        if let Some(cached) = &self.tools_cache {
            return Ok(cached.clone());
        }
        let response = self
            .service
            .list_tools(Default::default())
            .await
            .map_err(|e| AppError::Transient(format!("mcp server '{server_name}': list_tools failed: {e}")))?;

        let tools: Vec<McpTool> = response
            .tools
            .into_iter()
            .map(|t| McpTool {
                server: server_name.to_string(),
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: Some(serde_json::to_value(&t.input_schema).unwrap_or_default()),
            })
            .collect();

        self.tools_cache = Some(tools.clone());
        Ok(tools)
    }

    pub async fn call_tool(
        &mut self,
        server_name: &str,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> AppResult<CallToolResult> {
        let args = arguments.and_then(|v| v.as_object().cloned());
        self.service
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments: args,
                task: None,
            })
            .await
            .map_err(|e| AppError::Transient(format!("mcp server '{server_name}': call_tool '{tool_name}' failed: {e}")))
    }

    pub async fn close(self) -> AppResult<()> {
        self.service
            .cancel()
            .await
            .map_err(|e| AppError::Transient(format!("mcp session close failed: {e}")))?;
        Ok(())
    }
}
