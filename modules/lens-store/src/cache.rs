//! Bounded in-process read cache for job list/detail endpoints.
//!
//! Keys are (endpoint, params) strings. At capacity the least-recently
//! written key is evicted. Entries past their TTL are served only as a
//! degraded fallback when the store is unreachable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

pub const CACHE_MAX_KEYS: usize = 256;
pub const CACHE_TTL: Duration = Duration::from_secs(2);

struct CacheEntry {
    inserted_at: Instant,
    data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheHit {
    /// Within TTL; serve without touching the store.
    Fresh(Value),
    /// Past TTL; usable only as a degraded fallback.
    Stale(Value),
    Miss,
}

pub struct ReadCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_keys: usize,
    ttl: Duration,
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new(CACHE_MAX_KEYS, CACHE_TTL)
    }
}

impl ReadCache {
    pub fn new(max_keys: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_keys,
            ttl,
        }
    }

    pub fn lookup(&self, key: &str) -> CacheHit {
        let entries = self.entries.lock().expect("read cache lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                CacheHit::Fresh(entry.data.clone())
            }
            Some(entry) => CacheHit::Stale(entry.data.clone()),
            None => CacheHit::Miss,
        }
    }

    pub fn store(&self, key: &str, data: Value) {
        let mut entries = self.entries.lock().expect("read cache lock poisoned");
        if !entries.contains_key(key) && entries.len() >= self.max_keys {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                inserted_at: Instant::now(),
                data,
            },
        );
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().expect("read cache lock poisoned");
        entries.retain(|k, _| !k.starts_with(prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_then_stale() {
        let cache = ReadCache::new(4, Duration::from_millis(20));
        cache.store("jobs_list:20", json!([1, 2]));
        assert_eq!(cache.lookup("jobs_list:20"), CacheHit::Fresh(json!([1, 2])));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.lookup("jobs_list:20"), CacheHit::Stale(json!([1, 2])));
    }

    #[test]
    fn miss_for_unknown_key() {
        let cache = ReadCache::default();
        assert_eq!(cache.lookup("nope"), CacheHit::Miss);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let cache = ReadCache::new(2, Duration::from_secs(60));
        cache.store("a", json!(1));
        std::thread::sleep(Duration::from_millis(5));
        cache.store("b", json!(2));
        std::thread::sleep(Duration::from_millis(5));
        cache.store("c", json!(3));
        assert_eq!(cache.lookup("a"), CacheHit::Miss);
        assert_eq!(cache.lookup("b"), CacheHit::Fresh(json!(2)));
        assert_eq!(cache.lookup("c"), CacheHit::Fresh(json!(3)));
    }

    #[test]
    fn rewriting_existing_key_does_not_evict() {
        let cache = ReadCache::new(2, Duration::from_secs(60));
        cache.store("a", json!(1));
        cache.store("b", json!(2));
        cache.store("a", json!(10));
        assert_eq!(cache.lookup("a"), CacheHit::Fresh(json!(10)));
        assert_eq!(cache.lookup("b"), CacheHit::Fresh(json!(2)));
    }

    #[test]
    fn prefix_invalidation() {
        let cache = ReadCache::default();
        cache.store("jobs_list:20", json!([]));
        cache.store("job_items:x:100", json!([]));
        cache.invalidate_prefix("jobs_list:");
        assert_eq!(cache.lookup("jobs_list:20"), CacheHit::Miss);
        assert!(matches!(cache.lookup("job_items:x:100"), CacheHit::Fresh(_)));
    }
}
