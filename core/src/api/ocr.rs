//! `POST /v1/ocr`: loads (or reuses) an `OcrWrapper` from the model cache
//! and recognizes text in the supplied base64-encoded images.

use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::runtime::wrappers::ocr::{OcrBackend, OcrResult, OcrWrapper};
use crate::runtime::wrappers::ModelHandle;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct OcrRequest {
    pub model: String,
    #[serde(default = "default_backend")]
    pub backend: OcrBackend,
    /// Base64-encoded image bytes.
    pub images: Vec<String>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub detect_layout: bool,
    #[serde(default)]
    pub return_boxes: bool,
}

fn default_backend() -> OcrBackend {
    OcrBackend::Tesseract
}

#[derive(Debug, Serialize)]
pub struct OcrResponse {
    pub results: Vec<OcrResult>,
}

pub async fn recognize(
    State(state): State<AppState>,
    Json(req): Json<OcrRequest>,
) -> AppResult<Json<OcrResponse>> {
    let key = format!("ocr:{}:{:?}", req.model, req.backend);
    let backend = req.backend;
    let languages = req.languages.clone().unwrap_or_default();
    let model_name = req.model.clone();

    let handle = state
        .model_cache
        .get_or_load(&key, || async move {
            let wrapper = OcrWrapper::new(model_name, backend);
            wrapper.load(languages).await?;
            Ok(ModelHandle::Ocr(wrapper))
        })
        .await?;

    let ModelHandle::Ocr(ocr) = handle.as_ref() else {
        return Err(AppError::Internal(anyhow::anyhow!(
            "cache key collision: expected an ocr handle"
        )));
    };

    let mut images = Vec::with_capacity(req.images.len());
    for encoded in &req.images {
        images.push(
            BASE64
                .decode(encoded)
                .map_err(|e| AppError::Validation(format!("invalid base64 image: {e}")))?,
        );
    }

    let results = ocr
        .recognize(&images, req.languages.as_deref(), req.detect_layout, req.return_boxes)
        .await?;
    Ok(Json(OcrResponse { results }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_vector() {
        assert_eq!(BASE64.decode("aGVsbG8=").unwrap(), b"hello");
    }
}
