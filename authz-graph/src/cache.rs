//! Read-through cache shared by every request for a tenant.
//!
//! Values are JSON strings under keys of the form
//! `{prefix}_{tenant}:{KIND}:{id}`. A miss first claims the key with a
//! unique sentinel, then reads storage, then swaps the sentinel for the
//! value. Invalidation deletes the key, sentinel included, so a fill that
//! started before a write can never land after it.

use crate::error::{GraphError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod redis_cache;

pub use redis_cache::RedisCache;

pub const DEFAULT_KEY_PREFIX: &str = "authz";

const SENTINEL_PREFIX: &str = "__fill__:";
/// How long a claimed key may stay unfilled before another reader can retry
const SENTINEL_TTL: Duration = Duration::from_secs(5);

/// Storage for cached values. Implementations must be safe for concurrent use.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Write only when the key is absent; returns whether the write happened
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Replace the value only while it still equals `expected`
    async fn compare_and_set(&self, key: &str, expected: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn invalidate(&self, keys: &[String]) -> Result<()>;

    /// Delete every key starting with `prefix`, returning how many were removed
    async fn flush(&self, prefix: &str) -> Result<u64>;

    /// Diagnostic dump of every live key under `prefix`, sorted by key
    async fn log_key_values(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

pub fn is_sentinel(value: &str) -> bool {
    value.starts_with(SENTINEL_PREFIX)
}

fn new_sentinel() -> String {
    format!("{}{}", SENTINEL_PREFIX, Uuid::new_v4())
}

// =============================================================================
// Key naming
// =============================================================================

/// Key names for one tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    namespace: String,
}

impl CacheKeys {
    pub fn new(prefix: &str, tenant_id: Uuid) -> Self {
        Self {
            namespace: format!("{}_{}", prefix, tenant_id),
        }
    }

    /// Everything cached for the tenant lives under this prefix
    pub fn namespace(&self) -> String {
        format!("{}:", self.namespace)
    }

    pub fn object_type(&self, id: Uuid) -> String {
        format!("{}:OBJTYPE:{}", self.namespace, id)
    }

    pub fn edge_type(&self, id: Uuid) -> String {
        format!("{}:EDGETYPE:{}", self.namespace, id)
    }

    pub fn object(&self, id: Uuid) -> String {
        format!("{}:OBJ:{}", self.namespace, id)
    }

    pub fn edge(&self, id: Uuid) -> String {
        format!("{}:EDGE:{}", self.namespace, id)
    }

    pub fn organization(&self, id: Uuid) -> String {
        format!("{}:ORG:{}", self.namespace, id)
    }

    pub fn outgoing_edges(&self, object_id: Uuid) -> String {
        format!("{}:EDGES:OUT:{}", self.namespace, object_id)
    }

    pub fn incoming_edges(&self, object_id: Uuid) -> String {
        format!("{}:EDGES:IN:{}", self.namespace, object_id)
    }

    /// Prefix of every cached single edge
    pub fn edge_prefix(&self) -> String {
        format!("{}:EDGE:", self.namespace)
    }

    /// Prefix of every cached per-object edge listing
    pub fn edge_listing_prefix(&self) -> String {
        format!("{}:EDGES:", self.namespace)
    }
}

/// Time-to-live per entity kind. Types change rarely; edges change often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTtls {
    pub object_type: Duration,
    pub edge_type: Duration,
    pub organization: Duration,
    pub object: Duration,
    pub edge: Duration,
    pub edge_listing: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            object_type: Duration::from_secs(60 * 60),
            edge_type: Duration::from_secs(60 * 60),
            organization: Duration::from_secs(60 * 60),
            object: Duration::from_secs(30 * 60),
            edge: Duration::from_secs(10 * 60),
            edge_listing: Duration::from_secs(10 * 60),
        }
    }
}

// =============================================================================
// Cache manager
// =============================================================================

/// Provider plus naming and TTL policy for one tenant
#[derive(Clone)]
pub struct CacheManager {
    provider: Arc<dyn CacheProvider>,
    keys: CacheKeys,
    ttls: CacheTtls,
}

impl CacheManager {
    pub fn new(provider: Arc<dyn CacheProvider>, keys: CacheKeys, ttls: CacheTtls) -> Self {
        Self {
            provider,
            keys,
            ttls,
        }
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    pub fn provider(&self) -> &Arc<dyn CacheProvider> {
        &self.provider
    }

    /// Serve `key` from cache, falling back to `fetch` and filling on the way out.
    ///
    /// Cache failures only cost the fill; the caller always gets the
    /// storage answer.
    pub async fn read_through<T, F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        match self.provider.get(key).await {
            Ok(Some(raw)) if !is_sentinel(&raw) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    debug!("Cache hit: {}", key);
                    return Ok(value);
                }
                Err(e) => warn!("Discarding undecodable cache entry {}: {}", key, e),
            },
            Ok(_) => {}
            Err(e) => {
                warn!("Cache read failed for {}, using storage: {}", key, e);
                return fetch().await;
            }
        }

        let sentinel = new_sentinel();
        let claimed = match self.provider.set_if_absent(key, &sentinel, SENTINEL_TTL).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Cache claim failed for {}: {}", key, e);
                false
            }
        };

        let value = fetch().await?;

        if claimed {
            match serde_json::to_string(&value) {
                Ok(raw) => match self.provider.compare_and_set(key, &sentinel, &raw, ttl).await {
                    Ok(true) => debug!("Cache filled: {}", key),
                    Ok(false) => debug!("Cache fill for {} dropped after invalidation", key),
                    Err(e) => warn!("Cache fill failed for {}: {}", key, e),
                },
                Err(e) => warn!("Cannot serialize cache value for {}: {}", key, e),
            }
        }
        Ok(value)
    }

    /// Remove keys after a committed write. Failure here is surfaced: a
    /// stale entry would outlive the write.
    pub async fn invalidate(&self, keys: Vec<String>) -> Result<()> {
        debug!("Invalidating {} cache keys", keys.len());
        self.provider
            .invalidate(&keys)
            .await
            .map_err(|e| GraphError::CacheError(format!("Failed to invalidate {:?}: {}", keys, e)))
    }

    pub async fn flush_prefix(&self, prefix: &str) -> Result<u64> {
        let removed = self
            .provider
            .flush(prefix)
            .await
            .map_err(|e| GraphError::CacheError(format!("Failed to flush {}: {}", prefix, e)))?;
        info!("Flushed {} cache keys under {}", removed, prefix);
        Ok(removed)
    }

    /// Drop everything cached for the tenant
    pub async fn flush_tenant(&self) -> Result<u64> {
        self.flush_prefix(&self.keys.namespace()).await
    }

    /// Drop every cached edge and edge listing
    pub async fn flush_edges(&self) -> Result<u64> {
        let listings = self.flush_prefix(&self.keys.edge_listing_prefix()).await?;
        let edges = self.flush_prefix(&self.keys.edge_prefix()).await?;
        Ok(listings + edges)
    }

    /// Log and return every cached entry under `prefix` within the tenant
    pub async fn log_key_values(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let full = format!("{}{}", self.keys.namespace(), prefix);
        let entries = self.provider.log_key_values(&full).await?;
        for (key, value) in &entries {
            info!("{} => {}", key, value);
        }
        Ok(entries)
    }
}

// =============================================================================
// In-process provider
// =============================================================================

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Process-local cache provider. Sharded, so invalidation only locks the
/// shards it touches.
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheProvider for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live() => Ok(false),
            Entry::Occupied(mut entry) => {
                entry.insert(CacheEntry::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(CacheEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn compare_and_set(&self, key: &str, expected: &str, value: &str, ttl: Duration) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live() && entry.value == expected => {
                *entry = CacheEntry::new(value, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn flush(&self, prefix: &str) -> Result<u64> {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn log_key_values(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut out: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live())
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (Arc<InMemoryCache>, CacheManager) {
        let provider = Arc::new(InMemoryCache::new());
        let manager = CacheManager::new(
            provider.clone(),
            CacheKeys::new(DEFAULT_KEY_PREFIX, Uuid::new_v4()),
            CacheTtls::default(),
        );
        (provider, manager)
    }

    #[tokio::test]
    async fn test_read_through_fills_once() {
        let (_, cache) = manager();
        let calls = AtomicUsize::new(0);
        let key = cache.keys().object(Uuid::nil());

        for _ in 0..3 {
            let value: String = cache
                .read_through(&key, Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("alice".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "alice");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidation_during_fill_drops_the_fill() {
        let (provider, cache) = manager();
        let key = cache.keys().edge(Uuid::nil());

        let value: String = cache
            .read_through(&key, Duration::from_secs(60), || {
                let cache = cache.clone();
                let key = key.clone();
                async move {
                    // a writer commits and invalidates while this read is in flight
                    cache.invalidate(vec![key]).await?;
                    Ok("stale".to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "stale");
        assert_eq!(provider.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flush_is_scoped_to_prefix() {
        let (provider, cache) = manager();
        let keys = cache.keys().clone();
        let ttl = Duration::from_secs(60);
        provider.set(&keys.edge(Uuid::new_v4()), "e", ttl).await.unwrap();
        provider.set(&keys.outgoing_edges(Uuid::new_v4()), "l", ttl).await.unwrap();
        provider.set(&keys.object_type(Uuid::new_v4()), "t", ttl).await.unwrap();

        assert_eq!(cache.flush_edges().await.unwrap(), 2);
        assert_eq!(provider.len(), 1);

        assert_eq!(cache.flush_tenant().await.unwrap(), 1);
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let provider = InMemoryCache::new();
        provider.set("k", "v", Duration::from_millis(0)).await.unwrap();
        assert_eq!(provider.get("k").await.unwrap(), None);
        assert!(provider.set_if_absent("k", "w", Duration::from_secs(5)).await.unwrap());
    }
}
