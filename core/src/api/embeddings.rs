//! `POST /v1/embeddings`: loads (or reuses) an `EncoderWrapper` from the
//! model cache and embeds the requested texts.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::runtime::wrappers::encoder::{EncoderWrapper, Pooling};
use crate::runtime::wrappers::ModelHandle;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: Vec<String>,
    #[serde(default)]
    pub model_dir: Option<String>,
    #[serde(default = "default_dim")]
    pub dim: usize,
}

fn default_dim() -> usize {
    384
}

#[derive(Debug, Serialize)]
pub struct EmbeddingsResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
}

pub async fn create_embeddings(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingsRequest>,
) -> AppResult<Json<EmbeddingsResponse>> {
    let key = format!("encoder:{}", req.model);
    let model_name = req.model.clone();
    let model_dir = req
        .model_dir
        .clone()
        .ok_or_else(|| AppError::Validation("model_dir is required to load an encoder".to_string()))?;
    let dim = req.dim;

    let handle = state
        .model_cache
        .get_or_load(&key, || async move {
            let wrapper = EncoderWrapper::new(model_name, Pooling::Mean, 32);
            wrapper.load(std::path::Path::new(&model_dir), dim).await?;
            Ok(ModelHandle::Encoder(wrapper))
        })
        .await?;

    let ModelHandle::Encoder(encoder) = handle.as_ref() else {
        return Err(AppError::Internal(anyhow::anyhow!(
            "cache key collision: expected an encoder handle"
        )));
    };

    let embeddings = encoder.embed(&req.input).await?;
    Ok(Json(EmbeddingsResponse {
        model: req.model,
        embeddings,
    }))
}
