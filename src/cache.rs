//! In-process catalog cache (spec §4.3).
//!
//! External cache backends are explicitly out of scope, so the resolver's
//! output is memoized in a process-local map behind a `tokio::sync::RwLock`,
//! keyed by the query shape and expired lazily on the next lookup past its
//! TTL. There is no cross-request invalidation on upload — eventual
//! consistency is an accepted tradeoff (spec §4.3, §5).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatalogCacheKey {
    pub arch: String,
    pub build: i32,
    pub major: i32,
    pub language: String,
    pub beta: bool,
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

pub struct CatalogCache {
    ttl: Duration,
    entries: RwLock<HashMap<CatalogCacheKey, Entry>>,
}

impl CatalogCache {
    pub fn new(ttl_seconds: u64) -> CatalogCache {
        CatalogCache {
            ttl: Duration::from_secs(ttl_seconds),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &CatalogCacheKey) -> Option<Value> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn put(&self, key: CatalogCacheKey, value: Value) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CatalogCacheKey {
        CatalogCacheKey {
            arch: "88f628x".to_string(),
            build: 1594,
            major: 3,
            language: "enu".to_string(),
            beta: false,
        }
    }

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let cache = CatalogCache::new(600);
        cache.put(key(), Value::String("hello".to_string())).await;
        assert_eq!(cache.get(&key()).await, Some(Value::String("hello".to_string())));
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let cache = CatalogCache::new(0);
        cache.put(key(), Value::String("hello".to_string())).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get(&key()).await, None);
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let cache = CatalogCache::new(600);
        assert_eq!(cache.get(&key()).await, None);
    }
}
