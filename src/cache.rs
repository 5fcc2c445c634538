//! Namespaced TTL cache used to absorb duplicate external calls.
//!
//! Backed by the `cache_entries` table. When no backing store is available
//! the cache degrades to an always-miss no-op so the pipeline keeps working
//! against the providers directly.

use crate::storage::Store;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub entries: u64,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct Cache {
    store: Option<Store>,
    counters: Arc<Mutex<(u64, u64, u64)>>,
}

impl Cache {
    pub fn new(store: Store) -> Self {
        Self {
            store: Some(store),
            counters: Arc::new(Mutex::new((0, 0, 0))),
        }
    }

    /// Always-miss cache for when the backing store is unreachable.
    pub fn disabled() -> Self {
        Self {
            store: None,
            counters: Arc::new(Mutex::new((0, 0, 0))),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.store.is_none()
    }

    fn key(prefix: &str, id: &str) -> String {
        format!("{}:{}", prefix, id)
    }

    pub fn get<T: DeserializeOwned>(&self, prefix: &str, id: &str) -> Option<T> {
        let store = self.store.as_ref()?;
        let raw = match store.cache_get(&Self::key(prefix, id)) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(prefix, error = %e, "Cache read failed; treating as miss");
                None
            }
        };
        let mut counters = self.counters.lock();
        match raw.and_then(|s| serde_json::from_str(&s).ok()) {
            Some(v) => {
                counters.0 += 1;
                Some(v)
            }
            None => {
                counters.1 += 1;
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, prefix: &str, id: &str, value: &T, ttl_secs: Option<i64>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let Ok(raw) = serde_json::to_string(value) else {
            return;
        };
        if let Err(e) = store.cache_set(&Self::key(prefix, id), &raw, ttl_secs) {
            warn!(prefix, error = %e, "Cache write failed");
            return;
        }
        self.counters.lock().2 += 1;
    }

    pub fn exists(&self, prefix: &str, id: &str) -> bool {
        self.store
            .as_ref()
            .and_then(|s| s.cache_get(&Self::key(prefix, id)).ok())
            .flatten()
            .is_some()
    }

    pub fn invalidate(&self, prefix: &str, id: &str) -> bool {
        self.store
            .as_ref()
            .and_then(|s| s.cache_delete(&Self::key(prefix, id)).ok())
            .unwrap_or(false)
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> u64 {
        self.store
            .as_ref()
            .and_then(|s| s.cache_delete_prefix(&format!("{}:", prefix)).ok())
            .unwrap_or(0)
    }

    /// Remaining TTL in seconds, if the key exists and carries one.
    pub fn ttl_of(&self, prefix: &str, id: &str) -> Option<i64> {
        self.store
            .as_ref()
            .and_then(|s| s.cache_ttl_of(&Self::key(prefix, id)).ok())
            .flatten()
    }

    pub fn clear_all(&self) -> u64 {
        self.store
            .as_ref()
            .and_then(|s| s.cache_clear().ok())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let (hits, misses, writes) = *self.counters.lock();
        CacheStats {
            hits,
            misses,
            writes,
            entries: self
                .store
                .as_ref()
                .and_then(|s| s.cache_count().ok())
                .unwrap_or(0),
            degraded: self.store.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss_accounting() {
        let cache = Cache::new(Store::open_in_memory().unwrap());
        assert!(cache.get::<String>("cnpj", "1").is_none());
        cache.set("cnpj", "1", &"hello".to_string(), Some(60));
        assert_eq!(cache.get::<String>("cnpj", "1"), Some("hello".to_string()));
        // Idempotent within TTL: same key, same value twice.
        assert_eq!(cache.get::<String>("cnpj", "1"), Some("hello".to_string()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert!(!stats.degraded);
    }

    #[test]
    fn prefix_invalidation_is_scoped() {
        let cache = Cache::new(Store::open_in_memory().unwrap());
        cache.set("cnpj", "1", &1u32, None);
        cache.set("cnpj", "2", &2u32, None);
        cache.set("cpf", "1", &3u32, None);
        assert_eq!(cache.invalidate_prefix("cnpj"), 2);
        assert!(cache.get::<u32>("cnpj", "1").is_none());
        assert_eq!(cache.get::<u32>("cpf", "1"), Some(3));
    }

    #[test]
    fn disabled_cache_is_always_miss() {
        let cache = Cache::disabled();
        cache.set("places", "x", &"v".to_string(), Some(60));
        assert!(cache.get::<String>("places", "x").is_none());
        assert!(!cache.exists("places", "x"));
        assert_eq!(cache.invalidate_prefix("places"), 0);
        assert!(cache.stats().degraded);
    }
}
