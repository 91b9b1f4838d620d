//! `POST/GET/DELETE /v1/polars/buffers[...]`: a named-buffer surface over
//! [`SlidingBuffer`], letting a caller create a buffer, append records, pull
//! rolling features, or inspect/tear one down.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::runtime::buffer::{BufferStats, Record, SlidingBuffer};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateBufferRequest {
    pub id: String,
    pub window_size: usize,
}

#[derive(Debug, Serialize)]
pub struct CreateBufferResponse {
    pub id: String,
    pub window_size: usize,
}

pub async fn create_buffer(
    State(state): State<AppState>,
    Json(req): Json<CreateBufferRequest>,
) -> AppResult<Json<CreateBufferResponse>> {
    let mut buffers = state.buffers.lock().await;
    if buffers.contains_key(&req.id) {
        return Err(AppError::Conflict(format!("buffer '{}' already exists", req.id)));
    }
    buffers.insert(req.id.clone(), Arc::new(SlidingBuffer::new(req.window_size)));
    Ok(Json(CreateBufferResponse {
        id: req.id,
        window_size: req.window_size,
    }))
}

#[derive(Debug, Serialize)]
pub struct ListBuffersResponse {
    pub ids: Vec<String>,
}

pub async fn list_buffers(State(state): State<AppState>) -> Json<ListBuffersResponse> {
    let buffers = state.buffers.lock().await;
    let mut ids: Vec<String> = buffers.keys().cloned().collect();
    ids.sort();
    Json(ListBuffersResponse { ids })
}

async fn lookup(state: &AppState, id: &str) -> AppResult<Arc<SlidingBuffer>> {
    let buffers = state.buffers.lock().await;
    buffers
        .get(id)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("buffer '{id}' not found")))
}

pub async fn get_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<BufferStats>> {
    let buffer = lookup(&state, &id).await?;
    Ok(Json(buffer.get_stats()))
}

pub async fn delete_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let mut buffers = state.buffers.lock().await;
    if buffers.remove(&id).is_none() {
        return Err(AppError::NotFound(format!("buffer '{id}' not found")));
    }
    Ok(Json(serde_json::json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
pub struct AppendBufferRequest {
    #[serde(default)]
    pub record: Option<Record>,
    #[serde(default)]
    pub records: Vec<Record>,
}

pub async fn append_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AppendBufferRequest>,
) -> AppResult<Json<BufferStats>> {
    let buffer = lookup(&state, &id).await?;
    if let Some(record) = req.record {
        buffer.append(record);
    }
    if !req.records.is_empty() {
        buffer.append_batch(req.records);
    }
    Ok(Json(buffer.get_stats()))
}

#[derive(Debug, Deserialize)]
pub struct BufferDataQuery {
    #[serde(default)]
    pub n: Option<usize>,
    #[serde(default)]
    pub with_features: bool,
    #[serde(default)]
    pub windows: Option<String>,
}

fn parse_windows(raw: Option<&str>) -> Vec<usize> {
    raw.map(|s| s.split(',').filter_map(|w| w.trim().parse().ok()).collect())
        .unwrap_or_default()
}

pub async fn get_buffer_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BufferDataQuery>,
) -> AppResult<Json<Vec<Record>>> {
    let buffer = lookup(&state, &id).await?;
    let windows = parse_windows(query.windows.as_deref());
    match query.n {
        Some(n) => {
            let df = buffer.get_latest(n, query.with_features, &windows)?;
            Ok(Json(dataframe_to_records(&df)?))
        }
        None => Ok(Json(buffer.to_list())),
    }
}

#[derive(Debug, Deserialize)]
pub struct FeaturesRequest {
    pub windows: Vec<usize>,
    #[serde(default)]
    pub include_lags: bool,
    #[serde(default)]
    pub lag_periods: Vec<i64>,
    #[serde(default)]
    pub fill_null_value: f64,
}

pub async fn buffer_features(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FeaturesRequest>,
) -> AppResult<Json<Vec<Record>>> {
    let buffer = lookup(&state, &id).await?;
    let df = buffer.get_features(&req.windows, req.include_lags, &req.lag_periods, req.fill_null_value)?;
    Ok(Json(dataframe_to_records(&df)?))
}

fn dataframe_to_records(df: &polars::prelude::DataFrame) -> AppResult<Vec<Record>> {
    use polars::prelude::*;

    let height = df.height();
    let mut out = vec![Record::new(); height];
    for series in df.get_columns() {
        if !series.dtype().is_numeric() {
            continue;
        }
        let name = series.name().to_string();
        let casted = series
            .cast(&DataType::Float64)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        let ca = casted.f64().map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        for (row, value) in ca.into_iter().enumerate() {
            if let Some(v) = value {
                out[row].insert(name.clone(), v);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_windows() {
        assert_eq!(parse_windows(Some("3,5, 10")), vec![3, 5, 10]);
        assert_eq!(parse_windows(None), Vec::<usize>::new());
    }

    #[test]
    fn dataframe_round_trips_numeric_columns() {
        let buf = SlidingBuffer::new(5);
        let mut r = Record::new();
        r.insert("x".to_string(), 1.5);
        buf.append(r);
        let df = buf.get_data().unwrap();
        let records = dataframe_to_records(&df).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["x"], 1.5);
    }
}
