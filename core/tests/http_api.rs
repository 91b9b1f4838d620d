//! HTTP surface integration tests: drive the assembled axum router directly
//! (via `tower::ServiceExt::oneshot`) the way the runtime server would see
//! real requests, without needing a bound TCP listener or a loaded model.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use llamafarm_core::api::{create_router, AppState};
use llamafarm_core::config::{ModelDescriptor, Provider, ProjectConfig, RuntimeConfig, SCHEMA_VERSION};
use llamafarm_core::mcp::McpService;
use llamafarm_core::orchestrator::ChatOrchestrator;
use llamafarm_core::runtime::cache::ModelCache;
use llamafarm_core::runtime::detector::DetectorManager;
use llamafarm_core::runtime::wrappers::ModelHandle;
use serde_json::{json, Value};
use tower::ServiceExt;

fn sample_config() -> ProjectConfig {
    ProjectConfig {
        schema_version: SCHEMA_VERSION.to_string(),
        name: "demo".to_string(),
        namespace: "acme".to_string(),
        runtime: RuntimeConfig {
            default_model: "chat".to_string(),
            models: vec![ModelDescriptor {
                name: "chat".to_string(),
                provider: Provider::Ollama,
                model: "llama3".to_string(),
                base_url: None,
                api_key: None,
                prompts: None,
            }],
        },
        prompts: vec![],
        rag: None,
        datasets: vec![],
        mcp: None,
    }
}

fn test_app(project_dir: std::path::PathBuf) -> axum::Router {
    let config = sample_config();
    let model_cache = Arc::new(ModelCache::<ModelHandle>::new(Duration::from_secs(300), 32));
    let detectors = Arc::new(DetectorManager::new());
    let mcp = Arc::new(McpService::new(Default::default()));
    let orchestrator = Arc::new(ChatOrchestrator::new(
        project_dir.clone(),
        config.clone(),
        mcp.clone(),
        None,
    ));
    let state = AppState::new(
        config,
        project_dir,
        model_cache,
        detectors,
        mcp,
        orchestrator,
        Duration::from_secs(300),
    );
    create_router(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path().to_path_buf());

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/healthz")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn models_list_starts_empty_with_no_cache_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("LF_DATA_DIR", dir.path());
    let app = test_app(dir.path().to_path_buf());

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/v1/models")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["models"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn polars_buffer_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path().to_path_buf());

    let create = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/v1/polars/buffers")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"id": "buf1", "window_size": 3}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), axum::http::StatusCode::OK);

    let duplicate = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/v1/polars/buffers")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"id": "buf1", "window_size": 3}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(duplicate.status(), axum::http::StatusCode::CONFLICT);

    let append = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/v1/polars/buffers/buf1/append")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"record": {"x": 1.0}}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(append.status(), axum::http::StatusCode::OK);
    let stats = body_json(append).await;
    assert_eq!(stats["size"], 1);

    let missing = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/v1/polars/buffers/ghost")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn anomaly_detector_warms_up_then_scores() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path().to_path_buf());

    let mut last_body = Value::Null;
    for i in 0..12u64 {
        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/anomaly/streaming/m1/process")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        json!({
                            "record": {"x": i as f64},
                            "index": i,
                            "config": {"min_samples": 10, "window_size": 50, "retrain_interval": 1000},
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        last_body = body_json(response).await;
    }

    assert_eq!(last_body["status"], "ready");
    assert!(last_body["score"].is_number());
}

#[tokio::test]
async fn unknown_model_download_chat_request_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path().to_path_buf());

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({
                        "model": "ghost-model",
                        "messages": [{"role": "user", "content": "hi"}],
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
}
