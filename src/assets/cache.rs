//! In-process asset cache keyed by connection id + asset type.
//!
//! Entries expire after a fixed TTL. Misses for the same key are coalesced:
//! the first caller fetches from the vendor while later callers wait on a
//! per-key lock and then read the freshly stored entry.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;
use crate::platforms::{Asset, AssetType};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub connection_id: Uuid,
    pub asset_type: AssetType,
}

impl CacheKey {
    pub fn new(connection_id: Uuid, asset_type: AssetType) -> Self {
        Self {
            connection_id,
            asset_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedAssets {
    pub assets: Vec<Asset>,
    pub fetched_at: DateTime<Utc>,
    stored_at: Instant,
}

/// Thread-safe TTL cache of discovered assets.
pub struct AssetCache {
    entries: RwLock<HashMap<CacheKey, CachedAssets>>,
    inflight: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    ttl: Duration,
    max_entries: usize,
}

impl AssetCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh entry for `key`, if any.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedAssets> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .cloned()
    }

    /// Store assets for `key`, evicting when the cache is full.
    pub async fn insert(&self, key: CacheKey, assets: Vec<Asset>) -> CachedAssets {
        let entry = CachedAssets {
            assets,
            fetched_at: Utc::now(),
            stored_at: Instant::now(),
        };

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, e| e.stored_at.elapsed() < ttl);

            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    debug!("Asset cache full, evicting {:?}", oldest);
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key, entry.clone());
        entry
    }

    /// Drop one asset type of a connection, or all of them when `asset_type` is `None`.
    /// Returns the number of entries removed.
    pub async fn invalidate(&self, connection_id: Uuid, asset_type: Option<AssetType>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| {
            k.connection_id != connection_id
                || asset_type.map(|t| t != k.asset_type).unwrap_or(false)
        });
        before - entries.len()
    }

    /// Remove expired entries. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Return the fresh entry for `key`, or run `fetch`, store and return its result.
    ///
    /// The boolean is `true` when the value came from the cache.
    pub async fn remember<F, Fut>(
        &self,
        key: CacheKey,
        fetch: F,
    ) -> Result<(CachedAssets, bool), ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Asset>, ApiError>>,
    {
        if let Some(hit) = self.get(&key).await {
            debug!("Asset cache hit {:?}", key);
            return Ok((hit, true));
        }

        let lock = self.key_lock(&key).await;
        let guard = lock.lock().await;

        // Another caller may have filled the entry while we waited.
        let result = match self.get(&key).await {
            Some(hit) => Ok((hit, true)),
            None => {
                debug!("Asset cache miss {:?}", key);
                match fetch().await {
                    Ok(assets) => Ok((self.insert(key.clone(), assets).await, false)),
                    Err(e) => Err(e),
                }
            }
        };

        drop(guard);
        self.release(&key, &lock).await;
        result
    }

    /// Fetch anew for `key`, ignoring any fresh entry.
    ///
    /// The current entry is replaced only when `fetch` succeeds; on error it
    /// stays in place and keeps serving plain reads.
    pub async fn refresh<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<CachedAssets, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Asset>, ApiError>>,
    {
        let lock = self.key_lock(&key).await;
        let guard = lock.lock().await;

        let result = match fetch().await {
            Ok(assets) => Ok(self.insert(key.clone(), assets).await),
            Err(e) => {
                debug!("Asset cache refresh of {:?} failed, keeping entry", key);
                Err(e)
            }
        };

        drop(guard);
        self.release(&key, &lock).await;
        result
    }

    async fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight.entry(key.clone()).or_default().clone()
    }

    async fn release(&self, key: &CacheKey, lock: &Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().await;
        if let Some(current) = inflight.get(key) {
            // Map + this caller hold the only references: nobody else is waiting.
            if Arc::ptr_eq(current, lock) && Arc::strong_count(lock) <= 2 {
                inflight.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pixel(id: &str) -> Asset {
        Asset::new(AssetType::Pixels, id, format!("Pixel {id}"))
    }

    #[tokio::test]
    async fn test_remember_caches_until_ttl() {
        let cache = AssetCache::new(Duration::from_millis(80), 10);
        let key = CacheKey::new(Uuid::new_v4(), AssetType::Pixels);
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let fetch = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ApiError>(vec![pixel("1")])
        };

        let (first, cached) = cache.remember(key.clone(), fetch).await.unwrap();
        assert!(!cached);
        assert_eq!(first.assets.len(), 1);

        let (_, cached) = cache.remember(key.clone(), fetch).await.unwrap();
        assert!(cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let (_, cached) = cache.remember(key, fetch).await.unwrap();
        assert!(!cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_errors_are_not_cached() {
        let cache = AssetCache::new(Duration::from_secs(60), 10);
        let key = CacheKey::new(Uuid::new_v4(), AssetType::Pages);

        let err = cache
            .remember(key.clone(), || async { Err(ApiError::RateLimited("meta".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::RateLimited(_)));
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_one_or_all_types() {
        let cache = AssetCache::new(Duration::from_secs(60), 10);
        let conn = Uuid::new_v4();
        let other = Uuid::new_v4();
        cache.insert(CacheKey::new(conn, AssetType::Pages), vec![]).await;
        cache.insert(CacheKey::new(conn, AssetType::Pixels), vec![]).await;
        cache.insert(CacheKey::new(other, AssetType::Pages), vec![]).await;

        assert_eq!(cache.invalidate(conn, Some(AssetType::Pages)).await, 1);
        assert!(cache.get(&CacheKey::new(conn, AssetType::Pixels)).await.is_some());

        assert_eq!(cache.invalidate(conn, None).await, 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&CacheKey::new(other, AssetType::Pages)).await.is_some());
    }

    #[tokio::test]
    async fn test_full_cache_evicts_oldest() {
        let cache = AssetCache::new(Duration::from_secs(60), 2);
        let a = CacheKey::new(Uuid::new_v4(), AssetType::Pages);
        let b = CacheKey::new(Uuid::new_v4(), AssetType::Pages);
        let c = CacheKey::new(Uuid::new_v4(), AssetType::Pages);

        cache.insert(a.clone(), vec![]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.insert(b.clone(), vec![]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.insert(c.clone(), vec![]).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&a).await.is_none());
        assert!(cache.get(&b).await.is_some());
        assert!(cache.get(&c).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let cache = Arc::new(AssetCache::new(Duration::from_secs(60), 10));
        let key = CacheKey::new(Uuid::new_v4(), AssetType::AdAccounts);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .remember(key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(vec![Asset::new(AssetType::AdAccounts, "act_1", "Main")])
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            let (entry, _) = handle.await.unwrap();
            assert_eq!(entry.assets[0].id, "act_1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_fresh_entry() {
        let cache = AssetCache::new(Duration::from_secs(60), 10);
        let key = CacheKey::new(Uuid::new_v4(), AssetType::Catalogs);
        cache.insert(key.clone(), vec![]).await;

        let entry = cache
            .refresh(key.clone(), || async {
                Ok(vec![Asset::new(AssetType::Catalogs, "cat_1", "Spring")])
            })
            .await
            .unwrap();
        assert_eq!(entry.assets.len(), 1);
        assert_eq!(cache.get(&key).await.unwrap().assets.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_entry() {
        let cache = AssetCache::new(Duration::from_secs(60), 10);
        let key = CacheKey::new(Uuid::new_v4(), AssetType::AdAccounts);
        cache
            .insert(key.clone(), vec![Asset::new(AssetType::AdAccounts, "act_1", "Main")])
            .await;

        let err = cache
            .refresh(key.clone(), || async { Err(ApiError::RateLimited("meta".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::RateLimited(_)));

        let kept = cache.get(&key).await.expect("entry survives a failed refresh");
        assert_eq!(kept.assets[0].id, "act_1");

        // A plain read is still a hit and never calls the vendor.
        let (entry, cached) = cache
            .remember(key, || async { Err(ApiError::Internal("unexpected fetch".into())) })
            .await
            .unwrap();
        assert!(cached);
        assert_eq!(entry.assets.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = AssetCache::new(Duration::from_millis(20), 10);
        cache
            .insert(CacheKey::new(Uuid::new_v4(), AssetType::Pages), vec![])
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.is_empty().await);
    }
}
