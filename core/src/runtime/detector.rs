//! Streaming anomaly detector: wraps a [`SlidingBuffer`] and an
//! [`AnomalyAdapter`], implementing the tick (inference) / tock (background
//! retrain) state machine from spec §4.4, and a process-wide manager keyed
//! by `model_id`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::runtime::buffer::{Record, SlidingBuffer};
use crate::runtime::wrappers::anomaly::{
    contamination_threshold, normalize_score, AnomalyAdapter, NormalizationMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorStatus {
    Collecting,
    Ready,
    Retraining,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub index: u64,
    pub score: Option<f64>,
    pub is_anomaly: Option<bool>,
    pub status: DetectorStatus,
    pub samples_until_ready: u64,
    pub model_version: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub results: Vec<ProcessResult>,
    pub wall_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStats {
    pub model_id: String,
    pub backend: String,
    pub status: DetectorStatus,
    pub model_version: u32,
    pub buffer_size: usize,
    pub samples_since_retrain: u64,
    pub normalization_mean: f64,
    pub normalization_std: f64,
}

struct NormalizationStats {
    mean: f64,
    std: f64,
}

/// Config for one detector instance.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub backend: String,
    pub window_size: usize,
    pub rolling_windows: Vec<usize>,
    pub min_samples: usize,
    pub retrain_interval: u64,
    pub contamination: f64,
    pub normalization: NormalizationMode,
    pub n_neighbors: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            backend: "ecod".to_string(),
            window_size: 500,
            rolling_windows: vec![],
            min_samples: 30,
            retrain_interval: 100,
            contamination: 0.1,
            normalization: NormalizationMode::Standardization,
            n_neighbors: 10,
        }
    }
}

/// One model's streaming detector state. `status == Collecting` iff no
/// detector has been fitted yet; `model_version` only increases.
pub struct StreamingDetector {
    model_id: String,
    config: DetectorConfig,
    buffer: SlidingBuffer,
    adapter: Mutex<Option<Arc<AnomalyAdapter>>>,
    norm_stats: Mutex<NormalizationStats>,
    threshold: Mutex<f64>,
    status: Mutex<DetectorStatus>,
    model_version: AtomicU32,
    samples_since_retrain: AtomicU64,
    total_processed: AtomicU64,
    is_retraining: AtomicBool,
}

impl StreamingDetector {
    pub fn new(model_id: impl Into<String>, config: DetectorConfig) -> Self {
        Self {
            model_id: model_id.into(),
            buffer: SlidingBuffer::new(config.window_size),
            adapter: Mutex::new(None),
            norm_stats: Mutex::new(NormalizationStats { mean: 0.0, std: 0.0 }),
            threshold: Mutex::new(0.0),
            status: Mutex::new(DetectorStatus::Collecting),
            model_version: AtomicU32::new(0),
            samples_since_retrain: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            config,
            is_retraining: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> DetectorStatus {
        *self.status.lock().unwrap()
    }

    pub fn model_version(&self) -> u32 {
        self.model_version.load(Ordering::SeqCst)
    }

    fn feature_vector(&self) -> AppResult<Vec<Vec<f64>>> {
        if self.config.rolling_windows.is_empty() {
            return self.buffer.get_numpy();
        }
        let df = self
            .buffer
            .get_features(&self.config.rolling_windows, false, &[], 0.0)?;
        let mut out = Vec::with_capacity(df.height());
        for _ in 0..df.height() {
            out.push(Vec::new());
        }
        for series in df.get_columns() {
            if !series.dtype().is_numeric() {
                continue;
            }
            let ca = series
                .f64()
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
            for (row, value) in ca.into_iter().enumerate() {
                out[row].push(value.unwrap_or(0.0));
            }
        }
        Ok(out)
    }

    fn latest_feature_row(&self) -> AppResult<Vec<f64>> {
        let rows = self.feature_vector()?;
        rows.into_iter()
            .last()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("buffer empty after append")))
    }

    /// Fits the adapter on the entire current buffer contents, recomputing
    /// normalization stats and the auto-derived threshold.
    fn train(&self) -> AppResult<()> {
        let training_rows = self.feature_vector()?;
        let adapter = Arc::new(AnomalyAdapter::new(&self.config.backend, self.config.n_neighbors)?);
        adapter.fit(&training_rows)?;
        let raw_scores = adapter.decision_function(&training_rows)?;
        let (mean, std) = adapter.normalization_stats()?;
        let normalized: Vec<f64> = raw_scores
            .iter()
            .map(|s| normalize_score(*s, self.config.normalization, mean, std))
            .collect();
        let threshold = contamination_threshold(&normalized, self.config.contamination);

        *self.adapter.lock().unwrap() = Some(adapter);
        *self.norm_stats.lock().unwrap() = NormalizationStats { mean, std };
        *self.threshold.lock().unwrap() = threshold;
        Ok(())
    }

    /// Processes one point: append, and either warm up, collect, score, or
    /// trigger a background retrain. `index` is caller-supplied (e.g. a
    /// monotonically increasing counter) and echoed back in the result.
    pub async fn process(self: &Arc<Self>, record: Record, index: u64) -> AppResult<ProcessResult> {
        self.buffer.append(record);
        self.total_processed.fetch_add(1, Ordering::SeqCst);

        let mut status = self.status.lock().unwrap();
        if *status == DetectorStatus::Collecting {
            if self.buffer.len() >= self.config.min_samples {
                drop(status);
                self.train()?;
                self.model_version.store(1, Ordering::SeqCst);
                *self.status.lock().unwrap() = DetectorStatus::Ready;
                return Ok(ProcessResult {
                    index,
                    score: None,
                    is_anomaly: None,
                    status: DetectorStatus::Ready,
                    samples_until_ready: 0,
                    model_version: 1,
                });
            }
            let remaining = (self.config.min_samples - self.buffer.len()) as u64;
            return Ok(ProcessResult {
                index,
                score: None,
                is_anomaly: None,
                status: DetectorStatus::Collecting,
                samples_until_ready: remaining,
                model_version: 0,
            });
        }
        drop(status);

        let adapter = self
            .adapter
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("ready detector has no adapter")))?;
        let row = self.latest_feature_row()?;
        let raw = adapter.decision_function(&[row])?[0];
        let (mean, std) = {
            let stats = self.norm_stats.lock().unwrap();
            (stats.mean, stats.std)
        };
        let score = normalize_score(raw, self.config.normalization, mean, std);
        let threshold = *self.threshold.lock().unwrap();
        let is_anomaly = score > threshold;

        let since = self.samples_since_retrain.fetch_add(1, Ordering::SeqCst) + 1;
        let current_status = self.status();
        if since >= self.config.retrain_interval
            && current_status == DetectorStatus::Ready
            && !self.is_retraining.swap(true, Ordering::SeqCst)
        {
            *self.status.lock().unwrap() = DetectorStatus::Retraining;
            let this = self.clone();
            tokio::spawn(async move {
                let result = this.train();
                if result.is_ok() {
                    this.model_version.fetch_add(1, Ordering::SeqCst);
                    this.samples_since_retrain.store(0, Ordering::SeqCst);
                } else if let Err(e) = result {
                    tracing::warn!(model_id = %this.model_id, error = %e, "background retrain failed");
                }
                *this.status.lock().unwrap() = DetectorStatus::Ready;
                this.is_retraining.store(false, Ordering::SeqCst);
            });
        }

        Ok(ProcessResult {
            index,
            score: Some(score),
            is_anomaly: Some(is_anomaly),
            status: self.status(),
            samples_until_ready: 0,
            model_version: self.model_version(),
        })
    }

    /// Semantically equivalent to looping `process`, but reports aggregate
    /// wall time for the whole batch.
    pub async fn process_batch(self: &Arc<Self>, records: Vec<(Record, u64)>) -> AppResult<BatchResult> {
        let start = Instant::now();
        let mut results = Vec::with_capacity(records.len());
        for (record, index) in records {
            results.push(self.process(record, index).await?);
        }
        Ok(BatchResult {
            results,
            wall_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    pub fn reset(&self) {
        self.buffer.clear();
        *self.adapter.lock().unwrap() = None;
        *self.status.lock().unwrap() = DetectorStatus::Collecting;
        self.model_version.store(0, Ordering::SeqCst);
        self.samples_since_retrain.store(0, Ordering::SeqCst);
    }

    pub fn stats(&self) -> DetectorStats {
        let norm = self.norm_stats.lock().unwrap();
        DetectorStats {
            model_id: self.model_id.clone(),
            backend: self.config.backend.clone(),
            status: self.status(),
            model_version: self.model_version(),
            buffer_size: self.buffer.len(),
            samples_since_retrain: self.samples_since_retrain.load(Ordering::SeqCst),
            normalization_mean: norm.mean,
            normalization_std: norm.std,
        }
    }
}

/// Process-wide registry of streaming detectors, indexed by `model_id`.
/// All mutations are guarded by a single lock; detector instances hold
/// their own internal locks for per-point work.
pub struct DetectorManager {
    detectors: Mutex<HashMap<String, Arc<StreamingDetector>>>,
}

impl Default for DetectorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorManager {
    pub fn new() -> Self {
        Self {
            detectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, model_id: &str, config: DetectorConfig) -> Arc<StreamingDetector> {
        let mut detectors = self.detectors.lock().unwrap();
        detectors
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(StreamingDetector::new(model_id, config)))
            .clone()
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<StreamingDetector>> {
        self.detectors.lock().unwrap().get(model_id).cloned()
    }

    pub fn delete(&self, model_id: &str) -> bool {
        self.detectors.lock().unwrap().remove(model_id).is_some()
    }

    pub fn list(&self) -> Vec<String> {
        self.detectors.lock().unwrap().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.detectors.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(x: f64) -> Record {
        let mut r = Record::new();
        r.insert("x".to_string(), x);
        r
    }

    fn config(min_samples: usize) -> DetectorConfig {
        DetectorConfig {
            backend: "ecod".to_string(),
            window_size: 200,
            rolling_windows: vec![],
            min_samples,
            retrain_interval: 1000,
            contamination: 0.1,
            normalization: NormalizationMode::Standardization,
            n_neighbors: 5,
        }
    }

    #[tokio::test]
    async fn warmup_reports_samples_until_ready_then_transitions() {
        let detector = Arc::new(StreamingDetector::new("m1", config(10)));
        for i in 0..9 {
            let result = detector.process(row(i as f64), i as u64).await.unwrap();
            assert_eq!(result.score, None);
            assert_eq!(result.status, DetectorStatus::Collecting);
            assert_eq!(result.samples_until_ready, 10 - (i as u64) - 1);
        }
        let result = detector.process(row(9.0), 9).await.unwrap();
        assert_eq!(result.status, DetectorStatus::Ready);
        assert_eq!(result.model_version, 1);

        let result = detector.process(row(10.0), 10).await.unwrap();
        assert!(result.score.is_some());
    }

    #[tokio::test]
    async fn status_collecting_iff_no_detector_fitted() {
        let detector = Arc::new(StreamingDetector::new("m2", config(5)));
        assert_eq!(detector.status(), DetectorStatus::Collecting);
        for i in 0..5 {
            detector.process(row(i as f64), i as u64).await.unwrap();
        }
        assert_eq!(detector.status(), DetectorStatus::Ready);
        assert!(detector.adapter.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn reset_returns_to_collecting() {
        let detector = Arc::new(StreamingDetector::new("m3", config(3)));
        for i in 0..5 {
            detector.process(row(i as f64), i as u64).await.unwrap();
        }
        detector.reset();
        assert_eq!(detector.status(), DetectorStatus::Collecting);
        assert_eq!(detector.model_version(), 0);
    }

    #[tokio::test]
    async fn manager_get_or_create_is_idempotent() {
        let manager = DetectorManager::new();
        let a = manager.get_or_create("m4", config(5));
        let b = manager.get_or_create("m4", config(5));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.list(), vec!["m4".to_string()]);
        assert!(manager.delete("m4"));
        assert!(manager.get("m4").is_none());
    }

    #[tokio::test]
    async fn batch_processing_matches_looping_process() {
        let detector = Arc::new(StreamingDetector::new("m5", config(5)));
        let batch: Vec<(Record, u64)> = (0..8).map(|i| (row(i as f64), i as u64)).collect();
        let result = detector.process_batch(batch).await.unwrap();
        assert_eq!(result.results.len(), 8);
        assert_eq!(result.results[4].status, DetectorStatus::Ready);
    }
}
