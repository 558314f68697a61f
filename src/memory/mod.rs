//! Hybrid memory: a vector index fronted by a fast cache.
//!
//! Entries are namespaced by [`Collection`] and immutable once stored.
//! [`MemoryService`] composes the index adapter, the cache, the circuit
//! breakers and the connection pool into one store/search/health API.
//!
//! ## Example
//!
//! ```rust,ignore
//! use hmr_core::memory::{Collection, MemoryFilter, Metadata};
//!
//! let entry = memory
//!     .store("fn verify_jwt() { ... }", vector, Metadata::new(), Collection::code())
//!     .await?;
//!
//! let outcome = memory
//!     .search(&query, &Collection::code(), &MemoryFilter::new(), 5)
//!     .await?;
//! if outcome.degraded {
//!     // served from stale cache or empty
//! }
//! ```

mod cache;
mod embedder;
mod index;
mod schema;
mod service;
mod types;

pub use cache::{CacheEntry, CacheKey, CacheStats, CacheStore, CachedResults, InMemoryCache};
pub use embedder::{Embedder, HashEmbedder};
pub use index::{IndexBackend, IndexConnector, SqliteIndexBackend, SqliteVectorIndex, VectorIndex};
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use service::{
    ComponentHealth, HealthReport, MemoryConfig, MemoryService, ResultSource, SearchOutcome,
};
pub use types::{
    cosine_similarity, rank_entries, Collection, MemoryEntry, MemoryFilter, MemoryId, Metadata,
    ScoredEntry,
};
