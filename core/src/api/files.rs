//! `POST /v1/files`: uploads file bytes into the project's content-addressed
//! blob store (`lf_data/raw/{file_hash}` + `lf_data/meta/{file_hash}.json`),
//! tracked in a TTL-indexed in-memory cache the same way the model cache
//! tracks loaded wrappers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::validate_path_component;
use crate::error::{AppError, AppResult};

use super::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct FileMeta {
    pub file_hash: String,
    pub original_file_name: String,
    pub mime_type: String,
    pub size: u64,
}

struct CacheEntry {
    meta: FileMeta,
    last_access: Instant,
}

/// TTL-indexed map from file hash to its metadata, mirroring the model
/// cache's read-refreshes-timestamp contract but without an eviction
/// callback: the blob itself stays on disk regardless of cache residency.
pub struct FileCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FileCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, meta: FileMeta) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            meta.file_hash.clone(),
            CacheEntry {
                meta,
                last_access: Instant::now(),
            },
        );
    }

    pub fn get(&self, hash: &str) -> Option<FileMeta> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(hash)?;
        entry.last_access = Instant::now();
        Some(entry.meta.clone())
    }

    /// Drains entries idle past the TTL. The caller decides what, if
    /// anything, to do with the now-uncached hashes (the blob on disk is
    /// left untouched; only cache residency is pruned).
    pub fn pop_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_access) > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        expired
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadFileRequest {
    pub file_name: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// Base64-encoded file bytes (kept consistent with the OCR endpoint's
    /// image encoding rather than introducing multipart parsing for one
    /// call site).
    pub content_base64: String,
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

#[derive(Debug, Serialize)]
pub struct UploadFileResponse {
    pub file_hash: String,
    pub original_file_name: String,
    pub mime_type: String,
    pub size: u64,
}

pub async fn upload_file(
    State(state): State<AppState>,
    Json(req): Json<UploadFileRequest>,
) -> AppResult<Json<UploadFileResponse>> {
    validate_path_component(&req.file_name, "file_name")?;
    let bytes = BASE64
        .decode(&req.content_base64)
        .map_err(|e| AppError::Validation(format!("invalid base64 content: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let file_hash = format!("{:x}", hasher.finalize());

    let raw_dir = state.project_dir.join("lf_data").join("raw");
    let meta_dir = state.project_dir.join("lf_data").join("meta");
    std::fs::create_dir_all(&raw_dir).map_err(|e| AppError::Internal(e.into()))?;
    std::fs::create_dir_all(&meta_dir).map_err(|e| AppError::Internal(e.into()))?;

    let raw_path = raw_dir.join(&file_hash);
    if !raw_path.exists() {
        std::fs::write(&raw_path, &bytes).map_err(|e| AppError::Internal(e.into()))?;
    }

    let meta = FileMeta {
        file_hash: file_hash.clone(),
        original_file_name: req.file_name.clone(),
        mime_type: req.mime_type.clone(),
        size: bytes.len() as u64,
    };

    let meta_path = meta_dir.join(format!("{file_hash}.json"));
    let meta_json = serde_json::to_string_pretty(&meta).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    let tmp_path = meta_path.with_extension("json.tmp");
    std::fs::write(&tmp_path, meta_json).map_err(|e| AppError::Internal(e.into()))?;
    std::fs::rename(&tmp_path, &meta_path).map_err(|e| AppError::Internal(e.into()))?;

    state.files.insert(meta.clone());

    Ok(Json(UploadFileResponse {
        file_hash: meta.file_hash,
        original_file_name: meta.original_file_name,
        mime_type: meta.mime_type,
        size: meta.size,
    }))
}

pub type SharedFileCache = Arc<FileCache>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_expired_drains_idle_entries() {
        let cache = FileCache::new(Duration::from_millis(10));
        cache.insert(FileMeta {
            file_hash: "abc".to_string(),
            original_file_name: "f.txt".to_string(),
            mime_type: "text/plain".to_string(),
            size: 3,
        });
        std::thread::sleep(Duration::from_millis(30));
        let expired = cache.pop_expired();
        assert_eq!(expired, vec!["abc".to_string()]);
    }

    #[test]
    fn get_refreshes_timestamp() {
        let cache = FileCache::new(Duration::from_millis(50));
        cache.insert(FileMeta {
            file_hash: "abc".to_string(),
            original_file_name: "f.txt".to_string(),
            mime_type: "text/plain".to_string(),
            size: 3,
        });
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("abc").is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.pop_expired().len(), 0);
    }

    #[test]
    fn decodes_known_vector() {
        assert_eq!(BASE64.decode("aGVsbG8=").unwrap(), b"hello");
    }
}
