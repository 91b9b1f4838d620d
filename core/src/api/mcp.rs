//! `GET /v1/mcp/servers`, `GET /v1/mcp/servers/{name}/tools`: a read-only
//! surface over the MCP Service's configured servers and their cached tool
//! schemas, so a caller (or an LLM proposing a config edit) can discover
//! what's wired up without driving a chat turn.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use crate::error::AppResult;
use crate::mcp::McpTool;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct ListServersResponse {
    pub servers: Vec<String>,
}

pub async fn list_servers(State(state): State<AppState>) -> Json<ListServersResponse> {
    Json(ListServersResponse {
        servers: state.mcp.list_servers(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListToolsResponse {
    pub tools: Vec<McpTool>,
}

pub async fn list_tools(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ListToolsResponse>> {
    let tools = state.mcp.list_tools(&name).await?;
    Ok(Json(ListToolsResponse { tools }))
}
