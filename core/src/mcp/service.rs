//! MCP Service and Tool Factory: gives the orchestrator a list of tool
//! definitions and a way to invoke them, holding one persistent session per
//! configured server for the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::{McpConfig, McpServerConfig};
use crate::error::{AppError, AppResult};
use super::session::PersistentSession;
use super::types::{McpTool, ToolDefinition};

pub struct McpService {
    servers: HashMap<String, McpServerConfig>,
    sessions: Mutex<HashMap<String, PersistentSession>>,
}

impl McpService {
    pub fn new(config: McpConfig) -> Self {
        let servers = config
            .servers
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        Self {
            servers,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn list_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    fn server_config(&self, name: &str) -> AppResult<&McpServerConfig> {
        self.servers
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("mcp server '{name}' is not configured")))
    }

    /// Idempotent: opens a session for `server` once, reusing it on every
    /// subsequent call. If initialization fails partway through, no entry
    /// is left behind in the session map.
    pub async fn get_or_create_persistent_session(&self, server: &str) -> AppResult<()> {
        let config = self.server_config(server)?.clone();
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(server) {
            return Ok(());
        }
        let session = PersistentSession::open(&config).await?;
        sessions.insert(server.to_string(), session);
        Ok(())
    }

    pub async fn close_persistent_session(&self, server: &str) -> AppResult<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(server) {
            session.close().await?;
        }
        Ok(())
    }

    pub async fn close_all_persistent_sessions(&self) -> AppResult<()> {
        let mut sessions = self.sessions.lock().await;
        let mut first_err = None;
        for (name, session) in sessions.drain() {
            if let Err(e) = session.close().await {
                tracing::warn!(server = %name, error = %e, "failed to close mcp session cleanly");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Opens a session if needed, calls `list_tools`, caching the result
    /// per-server until the session is closed.
    pub async fn list_tools(&self, server: &str) -> AppResult<Vec<McpTool>> {
        self.get_or_create_persistent_session(server).await?;
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(server)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("session vanished after open")))?;
        session.list_tools(server).await
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> AppResult<rmcp::model::CallToolResult> {
        self.get_or_create_persistent_session(server).await?;
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(server)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("session vanished after open")))?;
        session.call_tool(server, tool_name, arguments).await
    }

    /// Tool Factory: all tool definitions across every configured server,
    /// in the orchestrator's `ToolDefinition` shape.
    pub async fn tool_definitions(&self) -> AppResult<Vec<ToolDefinition>> {
        let mut out = Vec::new();
        for server in self.list_servers() {
            let tools = self.list_tools(&server).await?;
            out.extend(tools.into_iter().map(ToolDefinition::from));
        }
        Ok(out)
    }

    /// Tool Factory's invocation path: routes a `ToolDefinition` call back
    /// through its originating server's persistent session.
    pub async fn invoke(&self, tool: &ToolDefinition, arguments: Option<Value>) -> AppResult<rmcp::model::CallToolResult> {
        self.call_tool(&tool.server, &tool.mcp_tool_name, arguments).await
    }
}

pub type SharedMcpService = Arc<McpService>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpTransport;

    fn config_with(servers: Vec<McpServerConfig>) -> McpConfig {
        McpConfig { servers }
    }

    #[test]
    fn list_servers_is_sorted() {
        let service = McpService::new(config_with(vec![
            McpServerConfig {
                name: "zeta".to_string(),
                transport: McpTransport::Stdio,
                command: Some("echo".to_string()),
                args: vec![],
                env: Default::default(),
                base_url: None,
                headers: Default::default(),
            },
            McpServerConfig {
                name: "alpha".to_string(),
                transport: McpTransport::Stdio,
                command: Some("echo".to_string()),
                args: vec![],
                env: Default::default(),
                base_url: None,
                headers: Default::default(),
            },
        ]));
        assert_eq!(service.list_servers(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let service = McpService::new(config_with(vec![]));
        let result = service.get_or_create_persistent_session("missing").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
