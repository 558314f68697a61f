//! Failure isolation and bounded resource sharing.
//!
//! - [`CircuitBreaker`]: one per dependency (index, cache, each provider),
//!   held in a [`BreakerRegistry`] built once at startup
//! - [`ResourcePool`]: bounded checkout of expensive handles with
//!   guaranteed release through the [`Pooled`] guard

mod breaker;
mod pool;

pub use breaker::{
    provider_dependency, BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitSnapshot,
    CircuitState, CACHE_DEPENDENCY, INDEX_DEPENDENCY,
};
pub use pool::{
    PoolConfig, PoolStats, Pooled, ResourceFactory, ResourcePool, POOL_ACQUIRE_TIMEOUT_MS_DEFAULT,
    POOL_SIZE_MAX_DEFAULT, POOL_SIZE_MIN_DEFAULT,
};
