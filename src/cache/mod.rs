//! Response cache: a narrow key/value contract plus a JSON-aware manager.

mod redis_cache;

pub use self::redis_cache::RedisCache;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::metrics;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Deletes every key starting with `prefix`; returns how many were removed.
    async fn delete_by_pattern(&self, prefix: &str) -> anyhow::Result<u64>;
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Store plus the `ENABLE_CACHE` switch. When disabled, reads miss and writes are no-ops.
#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    enabled: bool,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// `Ok(None)` on a miss or an undecodable payload; store errors are returned.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        if !self.enabled {
            return Ok(None);
        }
        let Some(raw) = self.store.get(key).await? else {
            metrics::record_cache_miss();
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(v) => {
                metrics::record_cache_hit();
                Ok(Some(v))
            }
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                metrics::record_cache_miss();
                Ok(None)
            }
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let raw = serde_json::to_string(value)?;
        self.store.set(key, raw, ttl).await?;
        debug!(key, ttl_secs = ttl.as_secs(), "cache set");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.store.delete(key).await
    }

    pub async fn delete_by_pattern(&self, prefix: &str) -> anyhow::Result<u64> {
        if !self.enabled {
            return Ok(0);
        }
        self.store.delete_by_pattern(prefix).await
    }

    /// Reachability of the backing store, checked even when caching is switched off.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.store.ping().await
    }
}
