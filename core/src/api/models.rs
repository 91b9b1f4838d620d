//! `GET /v1/models`, `POST /v1/models/download`, `DELETE /v1/models/{name}`:
//! a thin read/preflight/delete surface over the on-disk model cache
//! directory (`runtime::device::model_cache_dir`). The actual weight
//! transfer (a registry pull) is out of scope here; this handler preflights
//! disk space and reports the outcome over SSE the way a real download
//! would. Deletion only covers locally cached weights: models namespaced
//! under a remote-serving provider (`ollama/`, `openai/`) are rejected with
//! a 400 rather than silently reporting success for a no-op.

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

use crate::error::{AppError, AppResult};
use crate::runtime::device::{self, DiskPreflight};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct ModelListEntry {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    pub models: Vec<ModelListEntry>,
}

fn dir_size(path: &std::path::Path) -> u64 {
    let mut total = 0u64;
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += metadata.len();
        }
    }
    total
}

/// Walks `runtime::device::model_cache_dir()`'s `{namespace}/{name}` layout.
/// Shared by the HTTP handler and the `llamafarmd models` CLI convenience.
pub fn list_models_on_disk() -> Vec<ModelListEntry> {
    let root = device::model_cache_dir();
    let mut models = Vec::new();
    let Ok(namespaces) = std::fs::read_dir(&root) else {
        return models;
    };
    for namespace in namespaces.flatten() {
        if !namespace.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let namespace_name = namespace.file_name().to_string_lossy().into_owned();
        let Ok(names) = std::fs::read_dir(namespace.path()) else {
            continue;
        };
        for name in names.flatten() {
            if !name.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let model_name = name.file_name().to_string_lossy().into_owned();
            let id = format!("{namespace_name}/{model_name}");
            models.push(ModelListEntry {
                size_bytes: dir_size(&name.path()),
                path: name.path().display().to_string(),
                name: model_name,
                id,
            });
        }
    }
    models
}

pub async fn list_models(State(_state): State<AppState>) -> AppResult<Json<ModelListResponse>> {
    Ok(Json(ModelListResponse {
        models: list_models_on_disk(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DownloadModelRequest {
    pub model_id: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub total_volume_bytes: u64,
}

pub async fn download_model(
    State(_state): State<AppState>,
    Json(req): Json<DownloadModelRequest>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let path = device::resolve_model_path(&req.model_id)?;
    std::fs::create_dir_all(path.parent().unwrap_or(&path)).map_err(|e| AppError::Internal(e.into()))?;

    let preflight: DiskPreflight = device::preflight_disk_space(&path, req.size_bytes, req.total_volume_bytes)?;
    if !preflight.fits {
        return Err(AppError::Resource(format!(
            "Insufficient disk space to download '{}'",
            req.model_id
        )));
    }

    let mut events = Vec::new();

    if preflight.low_space_warning {
        events.push(
            Event::default()
                .json_data(serde_json::json!({
                    "event": "warning",
                    "message": "free disk space will drop below 10% after this download",
                }))
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
        );
    }

    events.push(
        Event::default()
            .json_data(serde_json::json!({
                "event": "started",
                "model_id": req.model_id,
            }))
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
    );

    events.push(
        Event::default()
            .json_data(serde_json::json!({
                "event": "completed",
                "model_id": req.model_id,
                "path": path.display().to_string(),
            }))
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
    );

    Ok(Sse::new(stream::iter(events.into_iter().map(Ok))))
}

/// Namespaces that name a remote model-serving provider rather than a
/// locally cached weights directory. Nothing under these is ever written
/// to `model_cache_dir`, so there's nothing on disk to delete.
const UNSUPPORTED_DELETE_PROVIDERS: &[&str] = &["ollama", "openai"];

/// Rejects `name`s namespaced under a provider this cache doesn't manage,
/// before any disk lookup happens.
fn reject_unsupported_provider(name: &str) -> AppResult<()> {
    if let Some(namespace) = name.split('/').next() {
        if UNSUPPORTED_DELETE_PROVIDERS.contains(&namespace) {
            return Err(AppError::Validation(format!(
                "model '{name}' is served by provider '{namespace}', which does not support deletion"
            )));
        }
    }
    Ok(())
}

pub async fn delete_model(
    State(_state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    reject_unsupported_provider(&name)?;
    let path = device::resolve_model_path(&name)?;
    if !path.exists() {
        return Err(AppError::NotFound(format!("model '{name}' not found")));
    }
    std::fs::remove_dir_all(&path).map_err(|e| AppError::Internal(e.into()))?;
    Ok(Json(serde_json::json!({ "deleted": name })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_provider_namespace_is_rejected() {
        assert!(reject_unsupported_provider("ollama/llama3").is_err());
        assert!(reject_unsupported_provider("openai/gpt-4o").is_err());
    }

    #[test]
    fn local_namespace_passes_the_provider_check() {
        assert!(reject_unsupported_provider("org/model").is_ok());
        assert!(reject_unsupported_provider("unnamespaced-model").is_ok());
    }
}
