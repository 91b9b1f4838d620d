//! TTL model cache: a map from `kind:id` to a loaded model wrapper.
//!
//! Refreshes TTL on read, evicts synchronously on overflow, and exposes
//! `pop_expired` so a janitor task can perform `unload` outside the lock.
//! Loads are single-flight per key: concurrent callers for the same key
//! share one in-flight future and observe the same resulting wrapper.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppResult;

/// Anything the cache can own must be able to release its resources when
/// evicted or expired.
pub trait Unloadable: Send + Sync {
    fn unload(&self);
}

struct Entry<W> {
    wrapper: Arc<W>,
    last_access: Instant,
}

pub struct ModelCache<W> {
    entries: Mutex<HashMap<String, Entry<W>>>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ttl: Duration,
    maxsize: usize,
}

impl<W: Unloadable + 'static> ModelCache<W> {
    pub fn new(ttl: Duration, maxsize: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            ttl,
            maxsize,
        }
    }

    /// Returns the wrapper for `key`, refreshing its last-access timestamp.
    pub fn get(&self, key: &str) -> Option<Arc<W>> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(entry.wrapper.clone())
    }

    /// Inserts `wrapper` under `key` with a fresh timestamp. If the cache is
    /// at `maxsize` and `key` is not already present, the least-recently-used
    /// entry is evicted and its `unload` invoked (outside the map lock).
    pub fn put(&self, key: &str, wrapper: Arc<W>) {
        let evicted = {
            let mut entries = self.entries.lock().unwrap();
            let evicted = if !entries.contains_key(key) && entries.len() >= self.maxsize {
                entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone())
                    .and_then(|k| entries.remove(&k))
            } else {
                None
            };
            entries.insert(
                key.to_string(),
                Entry {
                    wrapper,
                    last_access: Instant::now(),
                },
            );
            evicted
        };
        if let Some(entry) = evicted {
            entry.wrapper.unload();
        }
    }

    /// Drains every entry whose idle time exceeds `ttl`, returning them for
    /// the caller to `unload` outside the lock.
    pub fn pop_expired(&self) -> Vec<(String, Arc<W>)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let expired_keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_access) > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| (k, e.wrapper)))
            .collect()
    }

    /// Like `pop_expired`, but with an overridden TTL — used for the final
    /// shutdown sweep (`ttl = 0`), which drains everything.
    pub fn pop_expired_with_ttl(&self, ttl: Duration) -> Vec<(String, Arc<W>)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let expired_keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_access) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| (k, e.wrapper)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ensures `key` is loaded, running `loader` at most once even if
    /// many callers race for the same key. Callers that lose the race block
    /// on the winner's per-key lock and then observe the cached result.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> AppResult<Arc<W>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<W>>,
    {
        if let Some(w) = self.get(key) {
            return Ok(w);
        }
        let lock = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        if let Some(w) = self.get(key) {
            return Ok(w);
        }
        let wrapper = Arc::new(loader().await?);
        self.put(key, wrapper.clone());
        Ok(wrapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Dummy {
        unloaded: Arc<AtomicUsize>,
    }

    impl Unloadable for Dummy {
        fn unload(&self) {
            self.unloaded.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn get_refreshes_timestamp() {
        let cache: ModelCache<Dummy> = ModelCache::new(Duration::from_millis(50), 10);
        let flag = Arc::new(AtomicUsize::new(0));
        cache.put("lang:a", Arc::new(Dummy { unloaded: flag.clone() }));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("lang:a").is_some());
        std::thread::sleep(Duration::from_millis(30));
        // Still alive: the read at 30ms reset the clock.
        assert_eq!(cache.pop_expired().len(), 0);
    }

    #[test]
    fn pop_expired_drains_idle_entries() {
        let cache: ModelCache<Dummy> = ModelCache::new(Duration::from_millis(10), 10);
        let flag = Arc::new(AtomicUsize::new(0));
        cache.put("lang:a", Arc::new(Dummy { unloaded: flag.clone() }));
        std::thread::sleep(Duration::from_millis(30));
        let expired = cache.pop_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn put_evicts_lru_when_full() {
        let cache: ModelCache<Dummy> = ModelCache::new(Duration::from_secs(300), 1);
        let flag_a = Arc::new(AtomicUsize::new(0));
        let flag_b = Arc::new(AtomicUsize::new(0));
        cache.put("lang:a", Arc::new(Dummy { unloaded: flag_a.clone() }));
        cache.put("lang:b", Arc::new(Dummy { unloaded: flag_b.clone() }));
        assert_eq!(flag_a.load(Ordering::SeqCst), 1, "a should have been evicted and unloaded");
        assert_eq!(cache.len(), 1);
        assert!(cache.get("lang:b").is_some());
    }

    #[tokio::test]
    async fn get_or_load_is_single_flight() {
        let cache: Arc<ModelCache<Dummy>> = Arc::new(ModelCache::new(Duration::from_secs(300), 10));
        let load_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let load_count = load_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("lang:shared", || {
                        let load_count = load_count.clone();
                        async move {
                            load_count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(Dummy {
                                unloaded: Arc::new(AtomicUsize::new(0)),
                            })
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        let results: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(load_count.load(Ordering::SeqCst), 1);
        for w in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], w));
        }
    }
}
