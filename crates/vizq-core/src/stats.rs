use std::collections::BTreeMap;
use std::sync::Mutex;

pub const LOADING_FROM_CACHE: &str = "loading_from_cache";
pub const LOADED_FROM_CACHE: &str = "loaded_from_cache";
pub const LOADED_FROM_SOURCE: &str = "loaded_from_source";
pub const LOADED_FROM_SOURCE_WITHOUT_FORCE: &str = "loaded_from_source_without_force";
pub const SET_CACHE_KEY: &str = "set_cache_key";

/// Counter sink for cache and source activity.
pub trait StatsLogger: Send + Sync {
    fn incr(&self, key: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStats;

impl StatsLogger for NoopStats {
    fn incr(&self, _key: &str) {}
}

/// Counts increments in memory.
#[derive(Debug, Default)]
pub struct MemoryStats {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(key).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default()
    }
}

impl StatsLogger for MemoryStats {
    fn incr(&self, key: &str) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(key.to_owned()).or_default() += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stats_counts_per_key() {
        let stats = MemoryStats::new();
        stats.incr(LOADED_FROM_SOURCE);
        stats.incr(LOADED_FROM_SOURCE);
        stats.incr(SET_CACHE_KEY);

        assert_eq!(stats.count(LOADED_FROM_SOURCE), 2);
        assert_eq!(stats.count(SET_CACHE_KEY), 1);
        assert_eq!(stats.count(LOADED_FROM_CACHE), 0);
    }
}
