//! In-memory caching, storage, and named locks for the Apolo charging engine
//!
//! Provides the process-level services both engines coordinate through. They
//! are built once by the composition root and injected into each service:
//!
//! - [`MemoryCache`]: `CacheService` implementation with per-key TTL
//! - [`Guardian`]: named-lock service with acquisition timeout
//! - [`InMemoryDataManager`]: `DataManager` keeping whole entities in memory
//! - [`keys`]: key naming for cache entries and locks
//!
//! # Example
//!
//! ```
//! use apolo_cache::MemoryCache;
//! use apolo_core::traits::CacheService;
//!
//! # tokio_test::block_on(async {
//! let cache = MemoryCache::new();
//! cache.set("my_key", &"my_value", 60).await.unwrap();
//!
//! let value: Option<String> = cache.get("my_key").await.unwrap();
//! assert_eq!(value, Some("my_value".to_string()));
//! # });
//! ```

pub mod datamanager;
pub mod guardian;
pub mod keys;

pub use datamanager::InMemoryDataManager;
pub use guardian::Guardian;

use apolo_core::error::AppError;
use apolo_core::traits::CacheService;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// In-memory cache implementation
///
/// Values are stored as JSON so any serde type round-trips the same way it
/// would through a remote cache. Expired entries are dropped lazily on access
/// and by [`MemoryCache::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().values().filter(|e| e.is_live(now)).count()
    }

    /// Number of held entries, expired ones not yet purged included
    pub fn stored_len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops everything
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn live_value(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(e) if e.is_live(now) => return Some(e.value.clone()),
                Some(_) => {}
            }
        }
        self.entries.write().remove(key);
        None
    }
}

#[async_trait]
impl CacheService for MemoryCache {
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        match self.live_value(key) {
            Some(value) => {
                let value = serde_json::from_value::<T>(value).map_err(|e| {
                    error!("Failed to deserialize value for key {}: {}", key, e);
                    AppError::Serialization(format!("Deserialization failed: {}", e))
                })?;
                debug!("Cache HIT: {}", key);
                Ok(Some(value))
            }
            None => {
                debug!("Cache MISS: {}", key);
                Ok(None)
            }
        }
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), AppError> {
        debug!("SET {} (TTL: {}s)", key, ttl_secs);
        let value = serde_json::to_value(value).map_err(|e| {
            error!("Failed to serialize value for key {}: {}", key, e);
            AppError::Serialization(format!("Serialization failed: {}", e))
        })?;
        let expires_at = (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs));
        self.entries
            .write()
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        debug!("DEL {}", key);
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.live_value(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        id: i32,
        name: String,
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryCache::new();
        let data = TestData {
            id: 1,
            name: "Test".to_string(),
        };

        cache.set("test_key", &data, 60).await.unwrap();

        let result: Option<TestData> = cache.get("test_key").await.unwrap();
        assert_eq!(result, Some(data));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let cache = MemoryCache::new();
        let result: Option<TestData> = cache.get("nonexistent").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = MemoryCache::new();
        cache.set("test_key", &5u32, 0).await.unwrap();
        assert!(cache.exists("test_key").await.unwrap());

        assert!(cache.delete("test_key").await.unwrap());
        assert!(!cache.exists("test_key").await.unwrap());
        assert!(!cache.delete("test_key").await.unwrap());
    }

    #[tokio::test]
    async fn test_negative_entries() {
        let cache = MemoryCache::new();
        cache
            .set::<Option<Vec<String>>>("event_resources:EV1", &None, 60)
            .await
            .unwrap();

        let cached: Option<Option<Vec<String>>> = cache.get("event_resources:EV1").await.unwrap();
        assert_eq!(cached, Some(None));
    }

    #[tokio::test]
    async fn test_type_mismatch() {
        let cache = MemoryCache::new();
        cache.set("num", &42, 0).await.unwrap();
        let result = cache.get::<TestData>("num").await;
        assert!(matches!(result, Err(AppError::Serialization(_))));
    }

    #[test]
    fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache.entries.write().insert(
            "stale".to_string(),
            CacheEntry {
                value: Value::Null,
                expires_at: Some(Instant::now() - Duration::from_secs(1)),
            },
        );
        cache.entries.write().insert(
            "fresh".to_string(),
            CacheEntry {
                value: Value::Null,
                expires_at: None,
            },
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stored_len(), 2);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stored_len(), 1);

        assert!(!tokio_test::block_on(cache.exists("stale")).unwrap());
        assert!(tokio_test::block_on(cache.exists("fresh")).unwrap());
    }
}
