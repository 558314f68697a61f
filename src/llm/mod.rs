//! Provider registry and cost-aware task routing.
//!
//! Providers are described by a [`ProviderProfile`] (cost, affinities,
//! complexity tiers) and reached through the [`Provider`] contract. The
//! [`Router`] orders them per task and calls them with bounded fallback.
//!
//! ## Example
//!
//! ```rust,ignore
//! use hmr_core::llm::{
//!     ClientConfig, Complexity, HttpProvider, ProviderProfile, Registry, Router,
//!     RouterConfig, TaskRequest, TaskType,
//! };
//!
//! let provider = Arc::new(HttpProvider::new(
//!     "local",
//!     ClientConfig::new("http://localhost:9000/invoke"),
//! )?);
//! let registry = Registry::builder()
//!     .with_provider(
//!         ProviderProfile::new("local", 0.002)
//!             .with_affinities([TaskType::Generate])
//!             .with_tiers([Complexity::Simple, Complexity::Moderate]),
//!         provider,
//!     )
//!     .build()?;
//!
//! let router = Router::new(Arc::new(registry), &breakers, RouterConfig::default())?;
//! let decision = router.route(&TaskRequest::new(TaskType::Generate, "parse a CSV row"));
//! ```

mod client;
mod registry;
mod router;
mod types;

pub use client::{ClientConfig, HttpProvider, Provider};
pub use registry::{ProviderSlots, RegisteredProvider, Registry, RegistryBuilder};
pub use router::{Generation, Router, RouterConfig, RoutingDecision};
pub use types::{
    Completion, Complexity, ContextRef, CostTracker, LatencyClass, ProviderCosts,
    ProviderProfile, TaskHint, TaskRequest, TaskType,
};
