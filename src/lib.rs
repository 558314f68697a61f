//! # hmr-core
//!
//! A resilient hybrid memory layer feeding a multi-provider task router
//! with a bounded quality-feedback loop.
//!
//! ## Core Components
//!
//! - **Memory**: vector index + fast cache behind circuit breakers and a
//!   connection pool, with stale-cache fallback on search
//! - **Resilience**: per-dependency circuit breakers and bounded resource pools
//! - **LLM**: provider registry, cost-aware routing with bounded fallback
//! - **Validation**: deterministic quality scoring and one improvement pass
//! - **Orchestrator**: per-task state machine tying the above together
//!
//! ## Example
//!
//! ```rust,ignore
//! use hmr_core::{CoreConfig, TaskOrchestrator, TaskRequest, TaskType};
//!
//! let config = CoreConfig::from_file("~/.hmr/config.json")?;
//! let orchestrator = TaskOrchestrator::builder(config).build()?;
//!
//! let response = orchestrator
//!     .submit_task(TaskRequest::new(TaskType::Generate, "Parse ISO-8601 durations"))
//!     .await;
//! if response.success {
//!     println!("{} (quality {:?})", response.artifact.unwrap_or_default(), response.quality_score);
//! }
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod resilience;
pub mod validation;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::{CoreConfig, HttpProviderConfig};
pub use error::{Error, Result};
pub use llm::{
    ClientConfig, Complexity, ContextRef, CostTracker, Generation, HttpProvider, Provider,
    ProviderProfile, Registry, Router, RouterConfig, RoutingDecision, TaskRequest, TaskType,
};
pub use memory::{
    Collection, Embedder, HashEmbedder, HealthReport, InMemoryCache, MemoryConfig, MemoryEntry,
    MemoryFilter, MemoryService, SearchOutcome, SqliteIndexBackend,
};
pub use orchestrator::{
    OrchestratorBuilder, OrchestratorConfig, TaskOrchestrator, TaskResponse, TaskState,
    TaskTransition,
};
pub use resilience::{
    BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState, PoolConfig, ResourcePool,
};
pub use validation::{QualityConfig, QualityValidator, ValidationOutcome};
