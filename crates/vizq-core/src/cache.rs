//! Cache store contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::stats::{StatsLogger, SET_CACHE_KEY};
use crate::UtcDateTime;

/// Failure reported by a cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {message}")]
    Backend { message: String },

    #[error("cache lock poisoned")]
    Poisoned,

    #[error("cache payload is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Key-value store holding serialized payloads.
///
/// `timeout_seconds == 0` stores without expiry. `namespace` groups entries so a
/// backend can invalidate every entry of one datasource together; backends may
/// ignore it.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    fn set(
        &self,
        key: &str,
        value: &Value,
        timeout_seconds: u64,
        namespace: Option<&str>,
    ) -> Result<(), CacheError>;

    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    namespace: Option<String>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|expires_at| now <= expires_at).unwrap_or(true)
    }
}

/// Thread-safe in-process cache.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    inner: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }

    /// Drops every entry written under `namespace` and returns how many went.
    pub fn invalidate_namespace(&self, namespace: &str) -> Result<usize, CacheError> {
        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        let before = map.len();
        map.retain(|_, entry| entry.namespace.as_deref() != Some(namespace));
        Ok(before - map.len())
    }

    pub fn clear_expired(&self) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        map.retain(|_, entry| entry.is_live(now));
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.inner
            .write()
            .map_err(|_| CacheError::Poisoned)?
            .clear();
        Ok(())
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let map = self.inner.read().map_err(|_| CacheError::Poisoned)?;
        Ok(map
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone()))
    }

    fn set(
        &self,
        key: &str,
        value: &Value,
        timeout_seconds: u64,
        namespace: Option<&str>,
    ) -> Result<(), CacheError> {
        let expires_at = (timeout_seconds > 0)
            .then(|| Instant::now().checked_add(Duration::from_secs(timeout_seconds)))
            .flatten();
        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        map.insert(
            key.to_owned(),
            CacheEntry {
                value: value.clone(),
                namespace: namespace.map(str::to_owned),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner
            .write()
            .map_err(|_| CacheError::Poisoned)?
            .remove(key);
        Ok(())
    }
}

/// Stores `value` with a `dttm` write timestamp added. A failed write is logged
/// and the key deleted; the caller never sees the error.
pub fn set_and_log_cache(
    store: &dyn CacheStore,
    stats: &dyn StatsLogger,
    cache_key: &str,
    value: Value,
    timeout_seconds: u64,
    namespace: Option<&str>,
) {
    let value = match value {
        Value::Object(mut map) => {
            map.insert(
                String::from("dttm"),
                Value::String(UtcDateTime::now_seconds().format_rfc3339()),
            );
            Value::Object(map)
        }
        other => other,
    };

    match store.set(cache_key, &value, timeout_seconds, namespace) {
        Ok(()) => {
            debug!(cache_key, timeout_seconds, "cache entry stored");
            stats.incr(SET_CACHE_KEY);
        }
        Err(err) => {
            warn!(cache_key, error = %err, "could not cache key");
            if let Err(err) = store.delete(cache_key) {
                warn!(cache_key, error = %err, "could not delete cache key after failed write");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use super::*;
    use crate::stats::MemoryStats;

    #[derive(Default)]
    struct RejectingStore {
        deleted: AtomicBool,
    }

    impl CacheStore for RejectingStore {
        fn get(&self, _key: &str) -> Result<Option<Value>, CacheError> {
            Ok(None)
        }

        fn set(&self, _: &str, _: &Value, _: u64, _: Option<&str>) -> Result<(), CacheError> {
            Err(CacheError::backend("disk full"))
        }

        fn delete(&self, _key: &str) -> Result<(), CacheError> {
            self.deleted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn set_and_log_cache_stamps_dttm_and_counts() {
        let cache = MemoryCacheStore::new();
        let stats = MemoryStats::new();
        set_and_log_cache(&cache, &stats, "k", json!({"query": "SELECT 1"}), 60, None);

        let stored = cache.get("k").expect("get").expect("entry");
        assert!(stored["dttm"].as_str().is_some_and(|dttm| dttm.ends_with('Z')));
        assert_eq!(stats.count(SET_CACHE_KEY), 1);
    }

    #[test]
    fn failed_write_deletes_key_without_counting() {
        let store = RejectingStore::default();
        let stats = MemoryStats::new();
        set_and_log_cache(&store, &stats, "k", json!({}), 60, None);

        assert!(store.deleted.load(Ordering::SeqCst));
        assert_eq!(stats.count(SET_CACHE_KEY), 0);
    }

    #[test]
    fn set_get_and_overwrite() {
        let cache = MemoryCacheStore::new();
        assert!(cache.get("key1").expect("get").is_none());

        cache.set("key1", &json!({"v": 1}), 60, None).expect("set");
        assert_eq!(cache.get("key1").expect("get"), Some(json!({"v": 1})));

        cache.set("key1", &json!({"v": 2}), 60, None).expect("set");
        assert_eq!(cache.get("key1").expect("get"), Some(json!({"v": 2})));
    }

    #[test]
    fn zero_timeout_never_expires() {
        let cache = MemoryCacheStore::new();
        cache.set("key1", &json!(true), 0, None).expect("set");
        cache.clear_expired().expect("clear");
        assert!(cache.contains("key1"));
    }

    #[test]
    fn namespace_invalidation_only_touches_that_namespace() {
        let cache = MemoryCacheStore::new();
        cache.set("a", &json!(1), 60, Some("1__table")).expect("set");
        cache.set("b", &json!(2), 60, Some("1__table")).expect("set");
        cache.set("c", &json!(3), 60, Some("2__table")).expect("set");

        let removed = cache.invalidate_namespace("1__table").expect("invalidate");
        assert_eq!(removed, 2);
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_removes_entry() {
        let cache = MemoryCacheStore::new();
        cache.set("key1", &json!("x"), 60, None).expect("set");
        cache.delete("key1").expect("delete");
        assert!(cache.is_empty());
    }
}
