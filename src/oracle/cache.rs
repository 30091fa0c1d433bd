//! Concurrency-safe TTL cache for oracle responses.
//!
//! Keys are a hash of the canonicalized structured request (serde_json keeps
//! object keys sorted), never the raw prompt text. A miss racing with an
//! identical concurrent request may trigger one redundant oracle call; it can
//! never corrupt an entry.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use super::PromptKind;
use crate::config::CacheConfig;

struct CacheEntry {
    result: Value,
    inserted: Instant,
}

/// In-process oracle response cache with TTL and a bounded entry count.
pub struct ResponseCache {
    entries: RwLock<HashMap<u64, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    /// Create a cache with the given behavior.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::from_millis(config.ttl_ms),
            max_entries: config.max_entries,
        }
    }

    /// Deterministic cache key for a structured request.
    pub fn key(kind: PromptKind, context: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        kind.as_str().hash(&mut hasher);
        // serde_json::Value objects are BTreeMap-backed, so this string is a
        // canonical form of the context.
        context.to_string().hash(&mut hasher);
        hasher.finish()
    }

    /// Fetch a live entry, if present.
    pub fn get(&self, key: u64) -> Option<Value> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(&key)?;
        if entry.inserted.elapsed() > self.ttl {
            return None;
        }
        Some(entry.result.clone())
    }

    /// Store a validated result. Expired entries are pruned first; when the
    /// cache is still full the insert is skipped rather than evicting live
    /// entries.
    pub fn insert(&self, key: u64, result: Value) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.inserted.elapsed() <= ttl);
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            debug!(max_entries = self.max_entries, "Oracle cache full, skipping insert");
            return;
        }
        entries.insert(
            key,
            CacheEntry {
                result,
                inserted: Instant::now(),
            },
        );
    }

    /// Current number of entries, including any not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(ttl_ms: u64, max_entries: usize) -> ResponseCache {
        ResponseCache::new(&CacheConfig {
            ttl_ms,
            max_entries,
        })
    }

    #[test]
    fn test_key_is_deterministic_and_kind_sensitive() {
        let context = json!({"markers": ["Ferritin"], "status": "LOW"});
        let a = ResponseCache::key(PromptKind::EvidenceWeighting, &context);
        let b = ResponseCache::key(PromptKind::EvidenceWeighting, &context);
        assert_eq!(a, b);

        let c = ResponseCache::key(PromptKind::HypothesisGeneration, &context);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_ignores_object_key_order() {
        // serde_json sorts object keys, so logically-equal requests hash the
        // same however the caller assembled them.
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(
            ResponseCache::key(PromptKind::ContextSelection, &a),
            ResponseCache::key(PromptKind::ContextSelection, &b)
        );
    }

    #[test]
    fn test_insert_and_get() {
        let cache = cache(60_000, 16);
        let key = ResponseCache::key(PromptKind::EvidenceWeighting, &json!({"x": 1}));
        assert!(cache.get(key).is_none());
        cache.insert(key, json!({"weights": {}}));
        assert_eq!(cache.get(key).unwrap(), json!({"weights": {}}));
    }

    #[test]
    fn test_expired_entry_not_served() {
        let cache = cache(0, 16);
        let key = ResponseCache::key(PromptKind::EvidenceWeighting, &json!({"x": 1}));
        cache.insert(key, json!({"weights": {}}));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(key).is_none());
    }

    #[test]
    fn test_full_cache_skips_new_inserts() {
        let cache = cache(60_000, 1);
        let key_a = ResponseCache::key(PromptKind::EvidenceWeighting, &json!({"a": 1}));
        let key_b = ResponseCache::key(PromptKind::EvidenceWeighting, &json!({"b": 1}));
        cache.insert(key_a, json!(1));
        cache.insert(key_b, json!(2));
        assert!(cache.get(key_a).is_some());
        assert!(cache.get(key_b).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        let cache = Arc::new(cache(60_000, 256));
        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for j in 0..50 {
                    let key = ResponseCache::key(
                        PromptKind::EvidenceWeighting,
                        &json!({"thread": i, "iter": j}),
                    );
                    cache.insert(key, json!({"weights": {}}));
                    let _ = cache.get(key);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!cache.is_empty());
    }
}
