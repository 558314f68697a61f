//! Unified memory service: index + cache behind breakers and a pool.
//!
//! `store` is never degradable: an open index circuit surfaces as
//! [`Error::StorageDegraded`]. `search` always degrades instead of failing
//! once its inputs are valid: cache hit, then index, then the newest
//! unexpired cache entry of the collection, then an empty result.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::memory::cache::{CacheKey, CacheStats, CacheStore, CachedResults};
use crate::memory::index::{IndexBackend, IndexConnector};
use crate::memory::types::{Collection, MemoryEntry, MemoryFilter, Metadata, ScoredEntry};
use crate::resilience::{
    BreakerRegistry, CircuitBreaker, CircuitState, PoolConfig, PoolStats, ResourcePool,
    CACHE_DEPENDENCY, INDEX_DEPENDENCY,
};

/// Memory service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Lifetime of cached search results (default: 5 minutes)
    pub cache_ttl_secs: u64,
    /// Per-call bound on index store/search
    pub index_timeout_ms: u64,
    /// `top_k` used when a caller does not give one
    pub default_top_k: usize,
    /// Dimension of collections not listed in `collections`
    pub default_dimension: usize,
    /// Vector dimension per collection name
    pub collections: BTreeMap<String, usize>,
    /// SQLite index location; `~` is expanded
    pub index_path: String,
    /// Index connection pool
    pub pool: PoolConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let default_dimension = 384;
        let collections = [Collection::CODE, Collection::KNOWLEDGE, Collection::BUSINESS]
            .into_iter()
            .map(|name| (name.to_string(), default_dimension))
            .collect();
        Self {
            cache_ttl_secs: 300,
            index_timeout_ms: 10_000,
            default_top_k: 5,
            default_dimension,
            collections,
            index_path: "~/.hmr/memory.db".to_string(),
            pool: PoolConfig::default(),
        }
    }
}

impl MemoryConfig {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_index_timeout(mut self, timeout: Duration) -> Self {
        self.index_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set every collection to `dimension`, including the fallback.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.default_dimension = dimension;
        for value in self.collections.values_mut() {
            *value = dimension;
        }
        self
    }

    pub fn with_collection(mut self, name: impl AsRef<str>, dimension: usize) -> Self {
        self.collections
            .insert(Collection::new(name).to_string(), dimension);
        self
    }

    pub fn with_index_path(mut self, path: impl Into<String>) -> Self {
        self.index_path = path.into();
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_ms)
    }

    pub fn dimension_for(&self, collection: &Collection) -> usize {
        self.collections
            .get(collection.as_str())
            .copied()
            .unwrap_or(self.default_dimension)
    }

    /// `index_path` with `~` expanded.
    pub fn resolved_index_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.index_path).into_owned())
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_dimension == 0 {
            return Err(Error::Config("default_dimension must be positive".into()));
        }
        if let Some((name, _)) = self.collections.iter().find(|(_, dim)| **dim == 0) {
            return Err(Error::Config(format!(
                "collection {} has zero dimension",
                name
            )));
        }
        if self.default_top_k == 0 {
            return Err(Error::Config("default_top_k must be positive".into()));
        }
        if self.index_timeout_ms == 0 {
            return Err(Error::Config("index_timeout_ms must be positive".into()));
        }
        self.pool.validate()
    }
}

/// Where a search result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Cache,
    Index,
    StaleCache,
    Empty,
}

/// Result of [`MemoryService::search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub results: Vec<ScoredEntry>,
    /// True when the index could not be used and a fallback answered
    pub degraded: bool,
    pub source: ResultSource,
}

impl SearchOutcome {
    fn fresh(results: Vec<ScoredEntry>, source: ResultSource) -> Self {
        Self {
            results,
            degraded: false,
            source,
        }
    }

    fn fallback(results: Vec<ScoredEntry>, source: ResultSource) -> Self {
        Self {
            results,
            degraded: true,
            source,
        }
    }
}

/// Health of one dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub state: CircuitState,
    pub detail: String,
}

/// Health snapshot across every registered dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub components: BTreeMap<String, ComponentHealth>,
    pub pools: BTreeMap<String, PoolStats>,
    pub cache: CacheStats,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.components.values().all(|c| c.healthy)
    }

    pub fn unhealthy(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, c)| !c.healthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug, Default)]
struct ServiceCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_serves: AtomicU64,
    invalidations: AtomicU64,
}

/// Store/search/health over a pooled vector index and a fast cache.
pub struct MemoryService {
    config: MemoryConfig,
    pool: Arc<ResourcePool<IndexConnector>>,
    cache: Arc<dyn CacheStore>,
    breakers: Arc<BreakerRegistry>,
    index_breaker: Arc<CircuitBreaker>,
    cache_breaker: Arc<CircuitBreaker>,
    counters: ServiceCounters,
    /// Bumped by every store, per collection
    generations: DashMap<String, u64>,
}

impl MemoryService {
    /// The registry must already contain the `index` and `cache` breakers.
    pub fn new(
        config: MemoryConfig,
        backend: Arc<dyn IndexBackend>,
        cache: Arc<dyn CacheStore>,
        breakers: Arc<BreakerRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let index_breaker = breakers.get(INDEX_DEPENDENCY).ok_or_else(|| {
            Error::Config(format!("breaker '{}' not registered", INDEX_DEPENDENCY))
        })?;
        let cache_breaker = breakers.get(CACHE_DEPENDENCY).ok_or_else(|| {
            Error::Config(format!("breaker '{}' not registered", CACHE_DEPENDENCY))
        })?;
        let pool = ResourcePool::new(
            INDEX_DEPENDENCY,
            IndexConnector::new(backend),
            config.pool.clone(),
        )?;

        Ok(Self {
            config,
            pool,
            cache,
            breakers,
            index_breaker,
            cache_breaker,
            counters: ServiceCounters::default(),
            generations: DashMap::new(),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ResourcePool<IndexConnector>> {
        &self.pool
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn dimension_for(&self, collection: &Collection) -> usize {
        self.config.dimension_for(collection)
    }

    /// Open `min_size` index connections ahead of the first request.
    pub async fn warm_up(&self) -> Result<()> {
        self.pool.warm_up().await
    }

    fn generation(&self, collection: &Collection) -> u64 {
        self.generations
            .get(collection.as_str())
            .map(|g| *g)
            .unwrap_or(0)
    }

    fn check_dimension(&self, collection: &Collection, vector: &[f32]) -> Result<()> {
        let expected = self.dimension_for(collection);
        if vector.len() != expected {
            return Err(Error::DimensionMismatch {
                collection: collection.to_string(),
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Persist an entry and invalidate cached searches of its collection.
    #[instrument(skip_all, fields(collection = %collection))]
    pub async fn store(
        &self,
        content: impl Into<String>,
        vector: Vec<f32>,
        metadata: Metadata,
        collection: Collection,
    ) -> Result<MemoryEntry> {
        self.check_dimension(&collection, &vector)?;
        let entry = MemoryEntry::new(content, vector, metadata, collection);

        self.index_breaker
            .call(|| self.index_store(&entry))
            .await
            .map_err(|e| match e {
                Error::CircuitOpen { retry_after_ms, .. } => Error::StorageDegraded(format!(
                    "index circuit open, retry in {}ms",
                    retry_after_ms
                )),
                other => other,
            })?;

        *self
            .generations
            .entry(entry.collection.as_str().to_string())
            .or_insert(0) += 1;

        let prefix = CacheKey::collection_prefix(&entry.collection);
        match self
            .cache_breaker
            .call(|| self.cache.invalidate_prefix(&prefix))
            .await
        {
            Ok(removed) => {
                self.counters
                    .invalidations
                    .fetch_add(removed as u64, Ordering::Relaxed);
                debug!(removed, "Invalidated cached searches");
            }
            Err(e) => warn!(error = %e, "Cache invalidation failed; entries expire by TTL"),
        }

        info!(id = %entry.id, "Stored memory entry");
        Ok(entry)
    }

    async fn index_store(&self, entry: &MemoryEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let timeout = self.config.index_timeout();
        match tokio::time::timeout(timeout, conn.store(entry)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                if matches!(e, Error::IndexUnavailable(_)) {
                    conn.mark_broken();
                }
                Err(e)
            }
            Err(_) => {
                conn.mark_broken();
                Err(Error::timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Ranked search with cache, index and degraded fallbacks.
    ///
    /// Only invalid input is returned as `Err`.
    #[instrument(skip_all, fields(collection = %collection, top_k))]
    pub async fn search(
        &self,
        vector: &[f32],
        collection: &Collection,
        filter: &MemoryFilter,
        top_k: usize,
    ) -> Result<SearchOutcome> {
        if top_k == 0 {
            return Err(Error::InvalidInput("top_k must be positive".into()));
        }
        self.check_dimension(collection, vector)?;

        let key = CacheKey::for_search(collection, vector, filter, top_k);

        match self.cache_breaker.call(|| self.cache.get(&key)).await {
            Ok(Some(cached)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache hit");
                return Ok(SearchOutcome::fresh(cached.to_vec(), ResultSource::Cache));
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Cache read failed, treating as miss");
            }
        }

        let generation = self.generation(collection);
        let searched = self
            .index_breaker
            .call(|| self.index_search(collection, vector, top_k, filter))
            .await;

        match searched {
            Ok(results) => {
                self.cache_results(collection, generation, key, &results).await;
                Ok(SearchOutcome::fresh(results, ResultSource::Index))
            }
            Err(e) => {
                warn!(error = %e, "Index search failed, serving degraded result");
                Ok(self.degraded_search(collection).await)
            }
        }
    }

    /// Cache `results` unless a store into `collection` happened since
    /// they were read at `generation`.
    async fn cache_results(
        &self,
        collection: &Collection,
        generation: u64,
        key: CacheKey,
        results: &[ScoredEntry],
    ) {
        if self.generation(collection) != generation {
            debug!(key = %key, "Collection changed during search, not caching");
            return;
        }
        let cached: CachedResults = Arc::new(results.to_vec());
        let ttl = self.config.cache_ttl();
        let prefix = key.as_str().to_string();
        if let Err(e) = self
            .cache_breaker
            .call(|| self.cache.set(key, cached, ttl))
            .await
        {
            debug!(error = %e, "Cache write failed");
            return;
        }
        // A store may have invalidated between the check and the write
        if self.generation(collection) != generation {
            if let Err(e) = self
                .cache_breaker
                .call(|| self.cache.invalidate_prefix(&prefix))
                .await
            {
                debug!(error = %e, "Cache invalidation failed");
            }
        }
    }

    async fn index_search(
        &self,
        collection: &Collection,
        vector: &[f32],
        top_k: usize,
        filter: &MemoryFilter,
    ) -> Result<Vec<ScoredEntry>> {
        let mut conn = self.pool.acquire().await?;
        let timeout = self.config.index_timeout();
        match tokio::time::timeout(timeout, conn.search(collection, vector, top_k, filter)).await {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(e)) => {
                if matches!(e, Error::IndexUnavailable(_)) {
                    conn.mark_broken();
                }
                Err(e)
            }
            Err(_) => {
                conn.mark_broken();
                Err(Error::timeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn degraded_search(&self, collection: &Collection) -> SearchOutcome {
        let prefix = CacheKey::collection_prefix(collection);
        match self
            .cache_breaker
            .call(|| self.cache.latest_with_prefix(&prefix))
            .await
        {
            Ok(Some(stale)) => {
                self.counters.stale_serves.fetch_add(1, Ordering::Relaxed);
                SearchOutcome::fallback(stale.to_vec(), ResultSource::StaleCache)
            }
            Ok(None) => SearchOutcome::fallback(Vec::new(), ResultSource::Empty),
            Err(e) => {
                debug!(error = %e, "Stale cache lookup failed");
                SearchOutcome::fallback(Vec::new(), ResultSource::Empty)
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_serves: self.counters.stale_serves.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Breaker state of every registered dependency, with pool and cache
    /// counters.
    pub fn get_health(&self) -> HealthReport {
        let pool = self.pool.stats();
        let cache = self.cache_stats();

        let components = self
            .breakers
            .snapshots()
            .into_iter()
            .map(|snapshot| {
                let mut detail = match snapshot.open_for_ms {
                    Some(ms) if snapshot.state == CircuitState::Open => format!("open for {}ms", ms),
                    _ => format!("{} consecutive failures", snapshot.consecutive_failures),
                };
                if snapshot.name == INDEX_DEPENDENCY {
                    detail.push_str(&format!(
                        "; pool idle={} in_use={}/{}",
                        pool.idle, pool.in_use, pool.max_size
                    ));
                } else if snapshot.name == CACHE_DEPENDENCY {
                    detail.push_str(&format!("; hit rate {:.2}", cache.hit_rate()));
                }
                let health = ComponentHealth {
                    healthy: snapshot.is_healthy(),
                    state: snapshot.state,
                    detail,
                };
                (snapshot.name, health)
            })
            .collect();

        let mut pools = BTreeMap::new();
        pools.insert(INDEX_DEPENDENCY.to_string(), pool);

        HealthReport {
            components,
            pools,
            cache,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cache::InMemoryCache;
    use crate::resilience::BreakerConfig;
    use crate::testing::FakeIndexBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const DIM: usize = 3;

    fn registry() -> Arc<BreakerRegistry> {
        let mut registry = BreakerRegistry::new(
            BreakerConfig::default()
                .with_failure_threshold(3)
                .with_cooldown(Duration::from_secs(30)),
        );
        registry.register(INDEX_DEPENDENCY);
        registry.register(CACHE_DEPENDENCY);
        Arc::new(registry)
    }

    fn service(backend: &FakeIndexBackend) -> MemoryService {
        let config = MemoryConfig::default().with_dimension(DIM).with_pool(
            PoolConfig::default()
                .with_min_size(0)
                .with_max_size(2)
                .with_acquire_timeout(Duration::from_millis(200)),
        );
        MemoryService::new(
            config,
            Arc::new(backend.clone()),
            Arc::new(InMemoryCache::new()),
            registry(),
        )
        .unwrap()
    }

    fn meta(tag: &str) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("tag".into(), json!(tag));
        metadata
    }

    #[test]
    fn test_config_defaults() {
        let config = MemoryConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.dimension_for(&Collection::code()), 384);
        assert_eq!(config.dimension_for(&Collection::new("custom")), 384);
        assert!(config.validate().is_ok());
        assert!(!config.resolved_index_path().starts_with("~"));
    }

    #[test]
    fn test_requires_registered_breakers() {
        let backend = FakeIndexBackend::new();
        let result = MemoryService::new(
            MemoryConfig::default(),
            Arc::new(backend),
            Arc::new(InMemoryCache::new()),
            Arc::new(BreakerRegistry::default()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_cache_idempotence() {
        let backend = FakeIndexBackend::new();
        let memory = service(&backend);
        memory
            .store("fn auth()", vec![1.0, 0.0, 0.0], meta("a"), Collection::code())
            .await
            .unwrap();

        let query = [1.0, 0.0, 0.0];
        let filter = MemoryFilter::new();
        let first = memory
            .search(&query, &Collection::code(), &filter, 5)
            .await
            .unwrap();
        let second = memory
            .search(&query, &Collection::code(), &filter, 5)
            .await
            .unwrap();

        assert_eq!(backend.search_calls(), 1);
        assert_eq!(first.results, second.results);
        assert_eq!(first.source, ResultSource::Index);
        assert_eq!(second.source, ResultSource::Cache);
        assert!(!second.degraded);
        assert_eq!(memory.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_store_invalidates_collection_cache() {
        let backend = FakeIndexBackend::new();
        let memory = service(&backend);
        let query = [0.0, 1.0, 0.0];

        memory
            .search(&query, &Collection::code(), &MemoryFilter::new(), 3)
            .await
            .unwrap();
        memory
            .store("new", vec![0.0, 1.0, 0.0], meta("b"), Collection::code())
            .await
            .unwrap();
        let after = memory
            .search(&query, &Collection::code(), &MemoryFilter::new(), 3)
            .await
            .unwrap();

        assert_eq!(backend.search_calls(), 2);
        assert_eq!(after.results.len(), 1);
        assert_eq!(memory.cache_stats().invalidations, 1);
    }

    #[tokio::test]
    async fn test_search_overlapping_store_does_not_cache_stale_results() {
        let backend = FakeIndexBackend::new();
        let memory = Arc::new(service(&backend));
        let query = [0.0, 1.0, 0.0];

        let gate = backend.gate_next_search();
        let in_flight = {
            let memory = Arc::clone(&memory);
            tokio::spawn(async move {
                memory
                    .search(&query, &Collection::code(), &MemoryFilter::new(), 3)
                    .await
                    .unwrap()
            })
        };
        gate.entered.notified().await;

        memory
            .store("new", vec![0.0, 1.0, 0.0], meta("b"), Collection::code())
            .await
            .unwrap();
        gate.release.notify_one();

        let overlapped = in_flight.await.unwrap();
        assert!(overlapped.results.is_empty());

        let after = memory
            .search(&query, &Collection::code(), &MemoryFilter::new(), 3)
            .await
            .unwrap();
        assert_eq!(after.source, ResultSource::Index);
        assert_eq!(after.results.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let backend = FakeIndexBackend::new();
        let memory = service(&backend);

        let err = memory
            .store("x", vec![1.0], Metadata::new(), Collection::code())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 1, .. }));

        let err = memory
            .search(&[1.0], &Collection::code(), &MemoryFilter::new(), 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "dimension_mismatch");
        assert_eq!(backend.store_calls(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_serves_stale_then_empty() {
        let backend = FakeIndexBackend::new();
        let memory = service(&backend);
        memory
            .store("cached", vec![1.0, 0.0, 0.0], meta("a"), Collection::code())
            .await
            .unwrap();
        let warm = memory
            .search(&[1.0, 0.0, 0.0], &Collection::code(), &MemoryFilter::new(), 5)
            .await
            .unwrap();

        backend.set_failing(true);
        for i in 0..3 {
            let outcome = memory
                .search(&[0.0, 0.0, 1.0 + i as f32], &Collection::code(), &MemoryFilter::new(), 5)
                .await
                .unwrap();
            assert!(outcome.degraded);
        }
        let calls_before = backend.search_calls();

        let stale = memory
            .search(&[0.0, 1.0, 0.0], &Collection::code(), &MemoryFilter::new(), 5)
            .await
            .unwrap();
        assert_eq!(backend.search_calls(), calls_before);
        assert_eq!(stale.source, ResultSource::StaleCache);
        assert_eq!(stale.results, warm.results);

        let empty = memory
            .search(&[0.0, 1.0, 0.0], &Collection::business(), &MemoryFilter::new(), 5)
            .await
            .unwrap();
        assert!(empty.degraded);
        assert_eq!(empty.source, ResultSource::Empty);
        assert!(empty.results.is_empty());
    }

    #[tokio::test]
    async fn test_store_with_open_circuit_is_storage_degraded() {
        let backend = FakeIndexBackend::new();
        let memory = service(&backend);
        backend.set_failing(true);

        for _ in 0..3 {
            let err = memory
                .store("x", vec![1.0, 0.0, 0.0], Metadata::new(), Collection::code())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "index_unavailable");
        }
        let err = memory
            .store("x", vec![1.0, 0.0, 0.0], Metadata::new(), Collection::code())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageDegraded(_)));
        assert_eq!(backend.store_calls(), 3);
    }

    #[tokio::test]
    async fn test_health_reports_open_index() {
        let backend = FakeIndexBackend::new();
        let memory = service(&backend);
        assert!(memory.get_health().is_healthy());

        backend.set_failing(true);
        for _ in 0..3 {
            let _ = memory
                .search(&[1.0, 0.0, 0.0], &Collection::code(), &MemoryFilter::new(), 1)
                .await;
        }

        let health = memory.get_health();
        assert!(!health.is_healthy());
        assert_eq!(health.unhealthy(), vec![INDEX_DEPENDENCY]);
        assert_eq!(health.components[INDEX_DEPENDENCY].state, CircuitState::Open);
        assert!(health.components[CACHE_DEPENDENCY].healthy);
        assert!(health.pools.contains_key(INDEX_DEPENDENCY));
        assert!(serde_json::to_string(&health).is_ok());
    }
}
