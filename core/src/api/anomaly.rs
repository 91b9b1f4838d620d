//! Streaming anomaly detector endpoints: process/process_batch/reset/stats
//! per `model_id`, plus the backend registry and a detector-instance list.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::runtime::buffer::Record;
use crate::runtime::detector::{BatchResult, DetectorConfig, DetectorStats, ProcessResult};
use crate::runtime::wrappers::anomaly::{BackendMeta, NormalizationMode, BACKEND_REGISTRY};

use super::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct DetectorConfigBody {
    pub backend: Option<String>,
    pub window_size: Option<usize>,
    #[serde(default)]
    pub rolling_windows: Vec<usize>,
    pub min_samples: Option<usize>,
    pub retrain_interval: Option<u64>,
    pub contamination: Option<f64>,
    pub normalization: Option<NormalizationMode>,
    pub n_neighbors: Option<usize>,
}

impl DetectorConfigBody {
    fn into_config(self) -> DetectorConfig {
        let default = DetectorConfig::default();
        DetectorConfig {
            backend: self.backend.unwrap_or(default.backend),
            window_size: self.window_size.unwrap_or(default.window_size),
            rolling_windows: if self.rolling_windows.is_empty() {
                default.rolling_windows
            } else {
                self.rolling_windows
            },
            min_samples: self.min_samples.unwrap_or(default.min_samples),
            retrain_interval: self.retrain_interval.unwrap_or(default.retrain_interval),
            contamination: self.contamination.unwrap_or(default.contamination),
            normalization: self.normalization.unwrap_or(default.normalization),
            n_neighbors: self.n_neighbors.unwrap_or(default.n_neighbors),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub record: Record,
    pub index: u64,
    #[serde(default)]
    pub config: DetectorConfigBody,
}

pub async fn process(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Json(req): Json<ProcessRequest>,
) -> AppResult<Json<ProcessResult>> {
    let detector = state.detectors.get_or_create(&model_id, req.config.into_config());
    let result = detector.process(req.record, req.index).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ProcessBatchRequest {
    pub records: Vec<BatchRecord>,
    #[serde(default)]
    pub config: DetectorConfigBody,
}

#[derive(Debug, Deserialize)]
pub struct BatchRecord {
    pub record: Record,
    pub index: u64,
}

pub async fn process_batch(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Json(req): Json<ProcessBatchRequest>,
) -> AppResult<Json<BatchResult>> {
    let detector = state.detectors.get_or_create(&model_id, req.config.into_config());
    let records = req.records.into_iter().map(|r| (r.record, r.index)).collect();
    let result = detector.process_batch(records).await?;
    Ok(Json(result))
}

pub async fn reset(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let detector = state
        .detectors
        .get(&model_id)
        .ok_or_else(|| AppError::NotFound(format!("detector '{model_id}' not found")))?;
    detector.reset();
    Ok(Json(serde_json::json!({ "reset": model_id })))
}

pub async fn stats(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> AppResult<Json<DetectorStats>> {
    let detector = state
        .detectors
        .get(&model_id)
        .ok_or_else(|| AppError::NotFound(format!("detector '{model_id}' not found")))?;
    Ok(Json(detector.stats()))
}

pub async fn delete_detector(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    if !state.detectors.delete(&model_id) {
        return Err(AppError::NotFound(format!("detector '{model_id}' not found")));
    }
    Ok(Json(serde_json::json!({ "deleted": model_id })))
}

#[derive(Debug, Serialize)]
pub struct DetectorListResponse {
    pub model_ids: Vec<String>,
}

pub async fn list_detectors(State(state): State<AppState>) -> Json<DetectorListResponse> {
    Json(DetectorListResponse {
        model_ids: state.detectors.list(),
    })
}

#[derive(Debug, Serialize)]
pub struct BackendListResponse {
    pub backends: &'static [BackendMeta],
}

pub async fn list_backends() -> Json<BackendListResponse> {
    Json(BackendListResponse {
        backends: BACKEND_REGISTRY,
    })
}
