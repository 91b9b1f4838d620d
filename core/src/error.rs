//! The taxonomy of errors this crate raises, and how they cross the HTTP
//! boundary.
//!
//! Tool-execution and RAG-retrieval failures are never turned into an
//! `AppError` — the orchestrator folds them back into the conversation as a
//! tool/assistant message instead. Everything that reaches here is a failure
//! a caller outside the conversation needs to see.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Malformed request, unknown model/database/dataset, invalid field
    /// path, path traversal, schema-violating config edit.
    #[error("{0}")]
    Validation(String),

    /// Disk too small, model artifact missing, cache absent. 4xx where the
    /// caller can act, 500 otherwise — callers pick the matching variant.
    #[error("{0}")]
    Resource(String),

    /// Known-absent resource: unknown project/database/dataset/file.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate resource (e.g. a buffer id already in use).
    #[error("{0}")]
    Conflict(String),

    /// Network failure to an MCP server, RAG subprocess nonzero exit,
    /// upstream model endpoint error. Callers may retry a fixed budget.
    #[error("{0}")]
    Transient(String),

    /// Out-of-memory during load, missing tokenizer, unsupported transport.
    /// The request fails; the runtime process stays up.
    #[error("{0}")]
    FatalToRequest(String),

    /// Anything else — logged in full, never shown to the caller.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Resource(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Transient(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::FatalToRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

impl llamafarm_common::IntoMcpError for AppError {
    fn into_mcp_error(self) -> llamafarm_common::McpError {
        llamafarm_common::internal_error(self.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let resp = AppError::NotFound("no such model".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn conflict_maps_to_409() {
        let resp = AppError::Conflict("buffer exists".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn internal_hides_detail() {
        let resp = AppError::Internal(anyhow::anyhow!("/etc/shadow leaked")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
