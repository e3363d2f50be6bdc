//! Per-cloud expiring key/value cache for slow or rate-limited provider
//! queries (environment lists, keypairs, pricing tables).
//!
//! Backed by the persistence collaborator. Never used for live VM/disk
//! `data`: staleness there has billing and correctness consequences, so
//! that is always persisted directly through the reconciler.

use crate::error::Result;
use crate::server::Cloud;
use crate::store::{CacheEntry, Store};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Typed view over the store's raw cache rows.
#[derive(Clone)]
pub struct ResourceCache {
    store: Arc<dyn Store>,
}

impl ResourceCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Cached value for `(cloud, key)` if present and unexpired, else `None`.
    pub async fn get<T: DeserializeOwned>(&self, cloud: Cloud, key: &str) -> Result<Option<T>> {
        let Some(entry) = self.store.cache_get(cloud, key).await? else {
            return Ok(None);
        };
        if entry.expire <= Utc::now() {
            tracing::debug!(%cloud, %key, "cache entry expired");
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&entry.value)?))
    }

    /// Upsert `(cloud, key)` with a time-to-live.
    pub async fn set<T: Serialize>(
        &self,
        cloud: Cloud,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let expire = Utc::now()
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(0));
        let entry = CacheEntry {
            value: serde_json::to_string(value)?,
            expire,
        };
        self.store.cache_set(cloud, key, entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = ResourceCache::new(Arc::new(MemoryStore::new()));
        cache
            .set(
                Cloud::Hyperstack,
                "environments",
                &vec!["cirrus-CANADA-1".to_string()],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let values: Option<Vec<String>> = cache
            .get(Cloud::Hyperstack, "environments")
            .await
            .unwrap();
        assert_eq!(values, Some(vec!["cirrus-CANADA-1".to_string()]));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_missing() {
        let cache = ResourceCache::new(Arc::new(MemoryStore::new()));
        cache
            .set(Cloud::Hyperstack, "pricebook", &1.25f64, Duration::ZERO)
            .await
            .unwrap();
        let value: Option<f64> = cache.get(Cloud::Hyperstack, "pricebook").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn keys_are_scoped_per_cloud() {
        let cache = ResourceCache::new(Arc::new(MemoryStore::new()));
        cache
            .set(Cloud::Hyperstack, "k", &1u32, Duration::from_secs(60))
            .await
            .unwrap();
        let other: Option<u32> = cache.get(Cloud::GoogleCloud, "k").await.unwrap();
        assert_eq!(other, None);
    }
}
