//! Advisory cache for remote profile lookups. Nothing on the reconciliation path
//! reads from it, so a missing or failing cache never changes a report.

use crate::config::CacheConfig;
use moka::Expiry;
use moka::sync::Cache;
use serde_json::Value;
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache rejected key {0}")]
    Rejected(String),
    #[error("could not encode cache value: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait AdvisoryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    fn delete(&self, key: &str);
}

/// Builds the `resource#subject` key used for every cache entry.
pub fn cache_key(resource: &str, subject_id: &str) -> String {
    format!("{resource}#{subject_id}")
}

#[derive(Clone)]
struct Entry {
    value: Value,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

pub struct MokaCache {
    cache: Cache<String, Entry>,
}

impl MokaCache {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();

        MokaCache { cache }
    }
}

impl AdvisoryCache for MokaCache {
    fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).map(|entry| entry.value)
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        if key.is_empty() || ttl.is_zero() {
            return Err(CacheError::Rejected(key.to_string()));
        }
        self.cache.insert(key.to_string(), Entry { value, ttl });
        Ok(())
    }

    fn delete(&self, key: &str) {
        self.cache.invalidate(key);
    }
}

pub struct NoopCache;

impl AdvisoryCache for NoopCache {
    fn get(&self, _key: &str) -> Option<Value> {
        None
    }

    fn set(&self, _key: &str, _value: Value, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    fn delete(&self, _key: &str) {}
}

pub fn from_config(config: &CacheConfig) -> Box<dyn AdvisoryCache> {
    if config.enabled {
        Box::new(MokaCache::new(config.max_capacity))
    } else {
        Box::new(NoopCache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_delete() {
        let cache = MokaCache::new(10);
        let key = cache_key("bitbucket_user", "abc");
        assert_eq!(key, "bitbucket_user#abc");

        cache
            .set(&key, json!({"display_name": "Abc"}), Duration::from_secs(60))
            .unwrap();
        assert_eq!(cache.get(&key), Some(json!({"display_name": "Abc"})));

        cache.delete(&key);
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn test_entries_expire_after_their_ttl() {
        let cache = MokaCache::new(10);
        cache
            .set("short#1", json!(1), Duration::from_millis(20))
            .unwrap();
        cache.set("long#1", json!(2), Duration::from_secs(60)).unwrap();

        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(cache.get("short#1"), None);
        assert_eq!(cache.get("long#1"), Some(json!(2)));
    }

    #[test]
    fn test_rejects_unusable_entries() {
        let cache = MokaCache::new(10);
        assert!(cache.set("", json!(1), Duration::from_secs(1)).is_err());
        assert!(cache.set("k#1", json!(1), Duration::ZERO).is_err());
    }

    #[test]
    fn test_disabled_cache_is_noop() {
        let cache = from_config(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        cache.set("k#1", json!(1), Duration::from_secs(1)).unwrap();
        assert_eq!(cache.get("k#1"), None);
    }
}
