//! Thread-safe columnar sliding window over numeric records, backed by
//! `polars`, with lazily computed rolling statistics and lags.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use polars::prelude::*;
use serde::Serialize;

use crate::error::{AppError, AppResult};

pub type Record = BTreeMap<String, f64>;

#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub size: usize,
    pub window_size: usize,
    pub columns: Vec<String>,
    pub numeric_columns: Vec<String>,
    pub memory_bytes: usize,
    pub append_count: u64,
    pub avg_append_ms: f64,
}

struct Inner {
    rows: VecDeque<Record>,
    append_count: u64,
    total_append_time_ms: f64,
}

/// A fixed-window-size columnar buffer. `append`/`append_batch` are O(1)
/// amortized per row; feature computation never mutates stored rows.
pub struct SlidingBuffer {
    window_size: usize,
    inner: Mutex<Inner>,
}

impl SlidingBuffer {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            inner: Mutex::new(Inner {
                rows: VecDeque::with_capacity(window_size),
                append_count: 0,
                total_append_time_ms: 0.0,
            }),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends one row, truncating the front of the window if it overflows.
    pub fn append(&self, record: Record) {
        let start = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.rows.push_back(record);
        while inner.rows.len() > self.window_size {
            inner.rows.pop_front();
        }
        inner.append_count += 1;
        inner.total_append_time_ms += start.elapsed().as_secs_f64() * 1000.0;
    }

    /// Appends many rows, truncating once at the end.
    pub fn append_batch(&self, records: impl IntoIterator<Item = Record>) {
        let start = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let mut n = 0u64;
        for record in records {
            inner.rows.push_back(record);
            n += 1;
        }
        while inner.rows.len() > self.window_size {
            inner.rows.pop_front();
        }
        inner.append_count += n;
        inner.total_append_time_ms += start.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.rows.clear();
    }

    fn column_names(rows: &VecDeque<Record>) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for row in rows {
            for key in row.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }
        names.sort();
        names
    }

    /// Materializes the current window as a `DataFrame`. Missing values for
    /// a row that didn't carry a given column are represented as null.
    pub fn get_data(&self) -> AppResult<DataFrame> {
        let inner = self.inner.lock().unwrap();
        Self::rows_to_dataframe(&inner.rows)
    }

    fn rows_to_dataframe(rows: &VecDeque<Record>) -> AppResult<DataFrame> {
        let columns = Self::column_names(rows);
        let mut series_vec = Vec::with_capacity(columns.len());
        for name in &columns {
            let values: Vec<Option<f64>> = rows.iter().map(|r| r.get(name).copied()).collect();
            series_vec.push(Series::new(name.into(), values));
        }
        if series_vec.is_empty() {
            return Ok(DataFrame::empty());
        }
        DataFrame::new(series_vec).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))
    }

    /// Returns the table augmented with rolling mean/std/min/max for every
    /// `window` in `windows`, and lag columns for every period in
    /// `lag_periods` if `include_lags`. Cold-start nulls are filled with
    /// `fill_null_value` so every output row has a valid numeric vector.
    pub fn get_features(
        &self,
        windows: &[usize],
        include_lags: bool,
        lag_periods: &[i64],
        fill_null_value: f64,
    ) -> AppResult<DataFrame> {
        let df = self.get_data()?;
        if df.height() == 0 {
            return Ok(df);
        }
        let numeric_columns: Vec<String> = df
            .get_columns()
            .iter()
            .filter(|s| s.dtype().is_numeric())
            .map(|s| s.name().to_string())
            .collect();

        let mut exprs: Vec<Expr> = Vec::new();
        for name in &numeric_columns {
            for &window in windows {
                let opts = RollingOptionsFixedWindow {
                    window_size: window,
                    min_periods: 1,
                    weights: None,
                    center: false,
                    fn_params: None,
                };
                exprs.push(
                    col(name.as_str())
                        .rolling_mean(opts.clone())
                        .fill_null(lit(fill_null_value))
                        .alias(format!("{name}_rolling_mean_{window}")),
                );
                exprs.push(
                    col(name.as_str())
                        .rolling_std(opts.clone())
                        .fill_null(lit(fill_null_value))
                        .alias(format!("{name}_rolling_std_{window}")),
                );
                exprs.push(
                    col(name.as_str())
                        .rolling_min(opts.clone())
                        .fill_null(lit(fill_null_value))
                        .alias(format!("{name}_rolling_min_{window}")),
                );
                exprs.push(
                    col(name.as_str())
                        .rolling_max(opts)
                        .fill_null(lit(fill_null_value))
                        .alias(format!("{name}_rolling_max_{window}")),
                );
            }
            if include_lags {
                for &lag in lag_periods {
                    exprs.push(
                        col(name.as_str())
                            .shift(lit(lag))
                            .fill_null(lit(fill_null_value))
                            .alias(format!("{name}_lag_{lag}")),
                    );
                }
            }
        }

        df.lazy()
            .with_columns(exprs)
            .collect()
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))
    }

    /// The last `n` rows, optionally augmented with rolling features over
    /// `windows` (lags are included with period `[1]` when requested).
    pub fn get_latest(&self, n: usize, with_features: bool, windows: &[usize]) -> AppResult<DataFrame> {
        let df = if with_features {
            self.get_features(windows, false, &[], 0.0)?
        } else {
            self.get_data()?
        };
        let height = df.height();
        let offset = height.saturating_sub(n) as i64;
        df.slice(offset, n.min(height))
            .clone()
            .pipe(Ok)
    }

    /// Numeric columns only, in `(rows, cols)` row-major order.
    pub fn get_numpy(&self) -> AppResult<Vec<Vec<f64>>> {
        let df = self.get_data()?;
        let numeric: Vec<&Series> = df
            .get_columns()
            .iter()
            .filter(|s| s.dtype().is_numeric())
            .collect();
        let height = df.height();
        let mut out = vec![Vec::with_capacity(numeric.len()); height];
        for series in numeric {
            let ca = series.f64().map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
            for (row, value) in ca.into_iter().enumerate() {
                out[row].push(value.unwrap_or(0.0));
            }
        }
        Ok(out)
    }

    pub fn to_list(&self) -> Vec<Record> {
        self.inner.lock().unwrap().rows.iter().cloned().collect()
    }

    pub fn get_stats(&self) -> BufferStats {
        let inner = self.inner.lock().unwrap();
        let columns = Self::column_names(&inner.rows);
        let numeric_columns = columns.clone();
        let avg_append_ms = if inner.append_count > 0 {
            inner.total_append_time_ms / inner.append_count as f64
        } else {
            0.0
        };
        BufferStats {
            size: inner.rows.len(),
            window_size: self.window_size,
            memory_bytes: inner.rows.len() * columns.len() * std::mem::size_of::<f64>(),
            columns,
            numeric_columns,
            append_count: inner.append_count,
            avg_append_ms,
        }
    }
}

trait Pipe: Sized {
    fn pipe<T>(self, f: impl FnOnce(Self) -> T) -> T {
        f(self)
    }
}
impl<T> Pipe for T {}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(x: f64) -> Record {
        let mut r = Record::new();
        r.insert("x".to_string(), x);
        r
    }

    #[test]
    fn truncates_to_window_size() {
        let buf = SlidingBuffer::new(3);
        for i in 0..10 {
            buf.append(row(i as f64));
        }
        assert_eq!(buf.len(), 3);
        let list = buf.to_list();
        let values: Vec<f64> = list.iter().map(|r| r["x"]).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn append_batch_truncates_once_at_end() {
        let buf = SlidingBuffer::new(5);
        buf.append_batch((0..8).map(|i| row(i as f64)));
        assert_eq!(buf.len(), 5);
        let values: Vec<f64> = buf.to_list().iter().map(|r| r["x"]).collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn features_deterministic_without_new_appends() {
        let buf = SlidingBuffer::new(10);
        for i in 0..6 {
            buf.append(row(i as f64));
        }
        let a = buf.get_features(&[3], true, &[1], 0.0).unwrap();
        let b = buf.get_features(&[3], true, &[1], 0.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn clear_empties_buffer() {
        let buf = SlidingBuffer::new(5);
        buf.append(row(1.0));
        buf.clear();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn stats_reflect_contents() {
        let buf = SlidingBuffer::new(5);
        buf.append(row(1.0));
        buf.append(row(2.0));
        let stats = buf.get_stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.window_size, 5);
        assert_eq!(stats.append_count, 2);
    }
}
