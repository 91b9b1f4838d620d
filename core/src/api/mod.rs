//! Runtime HTTP Server: the axum router and shared application state that
//! expose the model runtime, chat orchestrator, anomaly detector, and MCP
//! service over HTTP.

pub mod anomaly;
pub mod chat;
pub mod embeddings;
pub mod files;
pub mod health;
pub mod mcp;
pub mod models;
pub mod ocr;
pub mod polars;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::sync::Mutex as AsyncMutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ProjectConfig;
use crate::mcp::SharedMcpService;
use crate::orchestrator::ChatOrchestrator;
use crate::runtime::buffer::SlidingBuffer;
use crate::runtime::cache::ModelCache;
use crate::runtime::detector::DetectorManager;
use crate::runtime::wrappers::ModelHandle;

pub use files::FileCache;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProjectConfig>,
    pub project_dir: Arc<PathBuf>,
    pub model_cache: Arc<ModelCache<ModelHandle>>,
    pub detectors: Arc<DetectorManager>,
    pub mcp: SharedMcpService,
    pub buffers: Arc<AsyncMutex<HashMap<String, Arc<SlidingBuffer>>>>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub files: Arc<FileCache>,
}

impl AppState {
    pub fn new(
        config: ProjectConfig,
        project_dir: PathBuf,
        model_cache: Arc<ModelCache<ModelHandle>>,
        detectors: Arc<DetectorManager>,
        mcp: SharedMcpService,
        orchestrator: Arc<ChatOrchestrator>,
        file_ttl: std::time::Duration,
    ) -> Self {
        Self {
            config: Arc::new(config),
            project_dir: Arc::new(project_dir),
            model_cache,
            detectors,
            mcp,
            buffers: Arc::new(AsyncMutex::new(HashMap::new())),
            orchestrator,
            files: Arc::new(FileCache::new(file_ttl)),
        }
    }
}

/// Assembles the full route tree: CORS and per-request tracing spans
/// wrapping `/v1`-prefixed, OpenAI-compatible-where-possible endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    });

    let v1 = Router::new()
        .route("/chat/completions", post(chat::completions))
        .route("/chat/sessions/:id", delete(chat::reset_session))
        .route("/models", get(models::list_models))
        .route("/models/download", post(models::download_model))
        .route("/models/:name", delete(models::delete_model))
        .route("/embeddings", post(embeddings::create_embeddings))
        .route("/ocr", post(ocr::recognize))
        .route(
            "/anomaly/streaming/:model_id/process",
            post(anomaly::process),
        )
        .route(
            "/anomaly/streaming/:model_id/process_batch",
            post(anomaly::process_batch),
        )
        .route(
            "/anomaly/streaming/:model_id/reset",
            post(anomaly::reset),
        )
        .route(
            "/anomaly/streaming/:model_id/stats",
            get(anomaly::stats),
        )
        .route(
            "/anomaly/streaming/:model_id",
            delete(anomaly::delete_detector),
        )
        .route("/anomaly/streaming", get(anomaly::list_detectors))
        .route("/anomaly/backends", get(anomaly::list_backends))
        .route("/polars/buffers", post(polars::create_buffer))
        .route("/polars/buffers", get(polars::list_buffers))
        .route("/polars/buffers/:id", get(polars::get_buffer))
        .route("/polars/buffers/:id", delete(polars::delete_buffer))
        .route("/polars/buffers/:id/data", get(polars::get_buffer_data))
        .route("/polars/buffers/:id/append", post(polars::append_buffer))
        .route("/polars/buffers/:id/features", post(polars::buffer_features))
        .route("/files", post(files::upload_file))
        .route("/mcp/servers", get(mcp::list_servers))
        .route("/mcp/servers/:name/tools", get(mcp::list_tools));

    Router::new()
        .route("/healthz", get(health::healthz))
        .nest("/v1", v1)
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}
