//! Fast cache for search results.
//!
//! Keys are `"{COLLECTION}/{sha256}"` so that a store into a collection can
//! invalidate every cached search of that collection by prefix.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::memory::types::{Collection, MemoryFilter, ScoredEntry};

/// Cached ranked results. Shared, never mutated after insertion.
pub type CachedResults = Arc<Vec<ScoredEntry>>;

/// Cache key for a search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Deterministic key for `(vector, collection, filter, top_k)`.
    pub fn for_search(
        collection: &Collection,
        vector: &[f32],
        filter: &MemoryFilter,
        top_k: usize,
    ) -> Self {
        let mut hasher = Sha256::new();

        hasher.update(b"vector:");
        for value in vector {
            hasher.update(value.to_le_bytes());
        }
        hasher.update(b"\nfilter:");
        // BTreeMap keys serialise in order
        if let Ok(filter_json) = serde_json::to_vec(&filter.equals) {
            hasher.update(&filter_json);
        }
        hasher.update(b"\ntop_k:");
        hasher.update((top_k as u64).to_le_bytes());

        let hash = hasher.finalize();
        CacheKey(format!("{}{:x}", Self::collection_prefix(collection), hash))
    }

    /// Prefix shared by every key of a collection.
    pub fn collection_prefix(collection: &Collection) -> String {
        format!("{}/", collection)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self.0.len().min(24);
        write!(f, "{}", &self.0[..end])
    }
}

/// Cache backend contract.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Unexpired value for `key`, if any.
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResults>>;

    /// Insert or replace. Last writer wins.
    async fn set(&self, key: CacheKey, value: CachedResults, ttl: Duration) -> Result<()>;

    /// Remove every key starting with `prefix`, returning how many.
    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize>;

    /// Most recently written unexpired value under `prefix`.
    async fn latest_with_prefix(&self, prefix: &str) -> Result<Option<CachedResults>>;
}

/// A cached value with its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: CachedResults,
    pub expires_at: Instant,
    /// Monotonic write sequence, larger is newer
    pub written_seq: u64,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache counters kept by the memory service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_serves: u64,
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// In-process cache over a sharded concurrent map.
///
/// Reads of different keys never contend on a single lock; writes only lock
/// the shard that owns the key.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
    seq: AtomicU64,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResults>> {
        let (value, expired) = match self.entries.get(key.as_str()) {
            Some(entry) if entry.is_expired() => (None, true),
            Some(entry) => (Some(Arc::clone(&entry.value)), false),
            None => (None, false),
        };
        // Shard guard released above; safe to take the write lock now
        if expired {
            self.entries
                .remove_if(key.as_str(), |_, entry| entry.is_expired());
        }
        Ok(value)
    }

    async fn set(&self, key: CacheKey, value: CachedResults, ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            key: key.clone(),
            value,
            expires_at: Instant::now() + ttl,
            written_seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.insert(key.0, entry);
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()))
    }

    async fn latest_with_prefix(&self, prefix: &str) -> Result<Option<CachedResults>> {
        let latest = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.is_expired())
            .max_by_key(|entry| entry.written_seq)
            .map(|entry| Arc::clone(&entry.value));
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{MemoryEntry, Metadata};

    fn results(content: &str) -> CachedResults {
        let entry = MemoryEntry::new(content, vec![1.0], Metadata::new(), Collection::code());
        Arc::new(vec![ScoredEntry { entry, score: 0.9 }])
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let filter = MemoryFilter::new().with_eq("lang", "rust");
        let k1 = CacheKey::for_search(&Collection::code(), &[0.1, 0.2], &filter, 5);
        let k2 = CacheKey::for_search(&Collection::code(), &[0.1, 0.2], &filter, 5);
        let k3 = CacheKey::for_search(&Collection::code(), &[0.1, 0.2], &filter, 6);
        let k4 = CacheKey::for_search(&Collection::knowledge(), &[0.1, 0.2], &filter, 5);

        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k1, k4);
        assert!(k1.as_str().starts_with("CODE/"));
    }

    #[test]
    fn test_hit_rate() {
        let mut stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        stats.hits = 2;
        stats.misses = 1;
        assert!((stats.hit_rate() - 0.667).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_get_set_and_expiry() {
        let cache = InMemoryCache::new();
        let key = CacheKey::for_search(&Collection::code(), &[1.0], &MemoryFilter::new(), 1);

        assert!(cache.get(&key).await.unwrap().is_none());
        cache
            .set(key.clone(), results("a"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get(&key).await.unwrap().is_some());

        cache.set(key.clone(), results("b"), Duration::ZERO).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
        // Expired entry was removed lazily
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_prefix_only_touches_collection() {
        let cache = InMemoryCache::new();
        let code = CacheKey::for_search(&Collection::code(), &[1.0], &MemoryFilter::new(), 1);
        let docs = CacheKey::for_search(&Collection::knowledge(), &[1.0], &MemoryFilter::new(), 1);
        let ttl = Duration::from_secs(60);
        cache.set(code.clone(), results("a"), ttl).await.unwrap();
        cache.set(docs.clone(), results("b"), ttl).await.unwrap();

        let removed = cache
            .invalidate_prefix(&CacheKey::collection_prefix(&Collection::code()))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(cache.get(&code).await.unwrap().is_none());
        assert!(cache.get(&docs).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_latest_with_prefix_prefers_newest_unexpired() {
        let cache = InMemoryCache::new();
        let prefix = CacheKey::collection_prefix(&Collection::code());
        let ttl = Duration::from_secs(60);
        let k1 = CacheKey::for_search(&Collection::code(), &[1.0], &MemoryFilter::new(), 1);
        let k2 = CacheKey::for_search(&Collection::code(), &[2.0], &MemoryFilter::new(), 1);
        let k3 = CacheKey::for_search(&Collection::code(), &[3.0], &MemoryFilter::new(), 1);

        cache.set(k1, results("old"), ttl).await.unwrap();
        cache.set(k2, results("new"), ttl).await.unwrap();
        cache.set(k3, results("expired"), Duration::ZERO).await.unwrap();

        let latest = cache.latest_with_prefix(&prefix).await.unwrap().unwrap();
        assert_eq!(latest[0].entry.content, "new");

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.latest_with_prefix("BUSINESS/").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(InMemoryCache::new());
        let ttl = Duration::from_secs(60);
        let keys: Vec<CacheKey> = (0..8)
            .map(|i| {
                CacheKey::for_search(&Collection::code(), &[i as f32], &MemoryFilter::new(), 1)
            })
            .collect();

        let mut tasks = Vec::new();
        for worker in 0..16 {
            let cache = Arc::clone(&cache);
            let keys = keys.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..50 {
                    let key = &keys[(worker + round) % keys.len()];
                    if worker % 2 == 0 {
                        let content = format!("w{}r{}", worker, round);
                        cache.set(key.clone(), results(&content), ttl).await.unwrap();
                    } else if let Some(found) = cache.get(key).await.unwrap() {
                        assert_eq!(found.len(), 1);
                        assert!(found[0].entry.content.starts_with('w'));
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.len(), keys.len());
        for key in &keys {
            assert!(cache.get(key).await.unwrap().is_some());
        }
    }
}
