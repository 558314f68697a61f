//! Cost-aware routing with bounded fallback.
//!
//! Candidate order for a task:
//! 1. Providers with affinity for the task type that support its
//!    complexity, cheapest first
//! 2. If none, providers with affinity only; then the whole registry
//! 3. If a budget ceiling is set and the first candidate's estimate exceeds
//!    it, the candidates become every registry provider within budget,
//!    cheapest first, ignoring affinity and complexity. If none fits, only
//!    the cheapest provider is used and `budget_exceeded` is reported.
//!
//! Invocation walks the candidates through each provider's circuit breaker,
//! making at most `1 + max_fallbacks` real attempts. Every attempt is
//! bounded by `attempt_timeout`, and all attempts together by the smaller
//! of `aggregate_timeout` and the caller's deadline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::orchestrator::{TaskResponse, TaskState};
use crate::resilience::{
    provider_dependency, BreakerRegistry, CircuitBreaker, PoolConfig, PoolStats, ResourcePool,
};

use super::registry::{ProviderSlots, Registry};
use super::types::{Completion, CostTracker, ProviderProfile, TaskHint, TaskRequest};

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Attempts allowed after the first (default: 2)
    pub max_fallbacks: usize,
    /// Bound on a single provider attempt (default: 30s)
    pub attempt_timeout_ms: u64,
    /// Bound on all attempts of one invocation (default: 90s)
    pub aggregate_timeout_ms: u64,
    /// Concurrent calls allowed per provider
    pub provider_concurrency: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_fallbacks: 2,
            attempt_timeout_ms: 30_000,
            aggregate_timeout_ms: 90_000,
            provider_concurrency: 4,
        }
    }
}

impl RouterConfig {
    pub fn with_max_fallbacks(mut self, max_fallbacks: usize) -> Self {
        self.max_fallbacks = max_fallbacks;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_aggregate_timeout(mut self, timeout: Duration) -> Self {
        self.aggregate_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_provider_concurrency(mut self, concurrency: usize) -> Self {
        self.provider_concurrency = concurrency;
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn aggregate_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregate_timeout_ms)
    }

    /// Upper bound on real provider calls per invocation.
    pub fn max_attempts(&self) -> usize {
        1 + self.max_fallbacks
    }

    pub fn validate(&self) -> Result<()> {
        if self.attempt_timeout_ms == 0 || self.aggregate_timeout_ms == 0 {
            return Err(Error::Config("router timeouts must be positive".into()));
        }
        if self.provider_concurrency == 0 {
            return Err(Error::Config("provider_concurrency must be positive".into()));
        }
        Ok(())
    }
}

/// Routing decision output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Provider names in the order they will be tried
    pub candidates: Vec<String>,
    /// Estimated size of the task in units
    pub estimated_units: f64,
    /// Estimated cost of the first candidate
    pub estimated_cost: f64,
    /// Candidates were replaced to fit the budget
    pub downgraded: bool,
    /// Even the cheapest provider exceeds the budget
    pub budget_exceeded: bool,
    /// Reasoning for selection
    pub reason: String,
}

// Stable sort keeps registration order among equal costs
fn by_cost(mut profiles: Vec<&ProviderProfile>) -> Vec<&ProviderProfile> {
    profiles.sort_by(|a, b| a.cost_per_unit.total_cmp(&b.cost_per_unit));
    profiles
}

/// A successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub artifact: String,
    pub provider_used: String,
    pub units: f64,
    /// Cost in USD
    pub cost: f64,
    /// Real provider calls made, including the successful one
    pub attempts: usize,
    /// Non-fatal problems (`budget_exceeded`)
    pub warnings: Vec<String>,
    /// A candidate was skipped because its circuit was open
    #[serde(default)]
    pub degraded: bool,
}

/// Cost-aware router over a [`Registry`].
pub struct Router {
    registry: Arc<Registry>,
    config: RouterConfig,
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
    slots: BTreeMap<String, Arc<ResourcePool<ProviderSlots>>>,
    costs: RwLock<CostTracker>,
}

impl Router {
    /// Every registry provider must have a `provider:<name>` breaker.
    pub fn new(
        registry: Arc<Registry>,
        breakers: &BreakerRegistry,
        config: RouterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pool_config = PoolConfig::default()
            .with_min_size(0)
            .with_max_size(config.provider_concurrency)
            .with_acquire_timeout(config.attempt_timeout());

        let mut provider_breakers = BTreeMap::new();
        let mut slots = BTreeMap::new();
        for name in registry.names() {
            let dependency = provider_dependency(name);
            let breaker = breakers.get(&dependency).ok_or_else(|| {
                Error::Config(format!("breaker '{}' not registered", dependency))
            })?;
            let entry = registry
                .get(name)
                .ok_or_else(|| Error::Internal(format!("provider '{}' vanished", name)))?;
            let pool = ResourcePool::new(
                dependency,
                ProviderSlots::new(Arc::clone(&entry.provider)),
                pool_config.clone(),
            )?;
            provider_breakers.insert(name.to_string(), breaker);
            slots.insert(name.to_string(), pool);
        }

        Ok(Self {
            registry,
            config,
            breakers: provider_breakers,
            slots,
            costs: RwLock::new(CostTracker::new()),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Order the registry for `task`.
    pub fn route(&self, task: &TaskRequest) -> RoutingDecision {
        let units = task.estimated_units();

        let capable = by_cost(
            self.registry
                .profiles()
                .filter(|p| p.handles(task.task_type) && p.supports(task.complexity))
                .collect(),
        );
        let (mut candidates, mut reason) = if !capable.is_empty() {
            (
                capable,
                format!("capable of {} at {}", task.task_type, task.complexity),
            )
        } else {
            let affine = by_cost(
                self.registry
                    .profiles()
                    .filter(|p| p.handles(task.task_type))
                    .collect(),
            );
            if !affine.is_empty() {
                (
                    affine,
                    format!(
                        "no provider supports {}, using {} affinity",
                        task.complexity, task.task_type
                    ),
                )
            } else {
                (
                    by_cost(self.registry.profiles().collect()),
                    format!("no provider handles {}, using full registry", task.task_type),
                )
            }
        };

        let mut downgraded = false;
        let mut budget_exceeded = false;
        if let (Some(ceiling), Some(first)) = (task.budget_ceiling, candidates.first()) {
            if first.estimate_cost(units) > ceiling {
                let all = by_cost(self.registry.profiles().collect());
                let within: Vec<&ProviderProfile> = all
                    .iter()
                    .copied()
                    .filter(|p| p.estimate_cost(units) <= ceiling)
                    .collect();
                downgraded = true;
                if within.is_empty() {
                    budget_exceeded = true;
                    candidates = all.into_iter().take(1).collect();
                    reason = format!("no provider within budget {:.4}, using cheapest", ceiling);
                } else {
                    candidates = within;
                    reason = format!("downgraded to fit budget {:.4}", ceiling);
                }
            }
        }

        let estimated_cost = candidates
            .first()
            .map(|p| p.estimate_cost(units))
            .unwrap_or(0.0);

        RoutingDecision {
            candidates: candidates.iter().map(|p| p.name.clone()).collect(),
            estimated_units: units,
            estimated_cost,
            downgraded,
            budget_exceeded,
            reason,
        }
    }

    /// Generate an artifact for `task` from `prompt`.
    ///
    /// `deadline` is the caller's overall deadline; when it is what cut the
    /// attempts short the error is [`Error::DeadlineExceeded`].
    #[instrument(skip_all, fields(task_type = %task.task_type, complexity = %task.complexity))]
    pub async fn generate(
        &self,
        task: &TaskRequest,
        prompt: &str,
        deadline: Option<Instant>,
    ) -> Result<Generation> {
        let decision = self.route(task);
        let hint = task.hint();
        debug!(candidates = ?decision.candidates, reason = %decision.reason, "Routed task");

        let mut warnings = Vec::new();
        if decision.budget_exceeded {
            let err = Error::BudgetExceeded {
                ceiling: task.budget_ceiling.unwrap_or_default(),
                cheapest: decision.estimated_cost,
            };
            warn!(error = %err, "Proceeding over budget with cheapest provider");
            warnings.push(err.code().to_string());
        }

        let started = Instant::now();
        let aggregate_end = started + self.config.aggregate_timeout();
        let (end, deadline_bound) = match deadline {
            Some(deadline) if deadline < aggregate_end => (deadline, true),
            _ => (aggregate_end, false),
        };

        let max_attempts = self.config.max_attempts();
        let mut attempts = 0;
        let mut failures = Vec::new();
        let mut degraded = false;

        for name in &decision.candidates {
            if attempts >= max_attempts {
                break;
            }
            let remaining = end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (Some(breaker), Some(profile)) =
                (self.breakers.get(name), self.registry.profile(name))
            else {
                continue;
            };

            let budget = remaining.min(self.config.attempt_timeout());
            let result = breaker
                .call(|| self.attempt(name, prompt, &hint, budget))
                .await;

            match result {
                Ok(completion) => {
                    attempts += 1;
                    let units = completion.units_used.unwrap_or(decision.estimated_units);
                    let cost = profile.estimate_cost(units);
                    self.costs.write().await.record(name, units, cost);
                    info!(provider = %name, attempts, cost, "Generation succeeded");
                    return Ok(Generation {
                        artifact: completion.artifact,
                        provider_used: name.clone(),
                        units,
                        cost,
                        attempts,
                        warnings,
                        degraded,
                    });
                }
                Err(e) if e.is_circuit_open() => {
                    debug!(provider = %name, "Skipping provider with open circuit");
                    degraded = true;
                    failures.push(format!("{}: {}", name, e));
                }
                Err(e) => {
                    attempts += 1;
                    self.costs.write().await.record_failure(name);
                    warn!(provider = %name, attempt = attempts, error = %e, "Provider attempt failed");
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if Instant::now() >= end && deadline_bound {
            let deadline_ms = end.saturating_duration_since(started).as_millis() as u64;
            return Err(Error::deadline_exceeded(deadline_ms));
        }
        Err(Error::AllProvidersFailed { attempts, failures })
    }

    async fn attempt(
        &self,
        name: &str,
        prompt: &str,
        hint: &TaskHint,
        budget: Duration,
    ) -> Result<Completion> {
        let pool = self
            .slots
            .get(name)
            .ok_or_else(|| Error::Internal(format!("no slot pool for '{}'", name)))?;

        let call = async {
            let slot = pool.acquire_timeout(budget).await?;
            slot.invoke(prompt, hint).await
        };
        match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(budget.as_millis() as u64)),
        }
    }

    /// Route and generate from the task description alone.
    ///
    /// Never fails: exhaustion yields `success == false` with
    /// `all_providers_failed` in `errors`.
    pub async fn invoke(&self, task: &TaskRequest) -> TaskResponse {
        let mut response = TaskResponse::new();
        match self.generate(task, &task.description, None).await {
            Ok(generation) => {
                response.success = true;
                response.artifact = Some(generation.artifact);
                response.provider_used = Some(generation.provider_used);
                response.cost_usd = generation.cost;
                response.errors = generation.warnings;
                response.degraded = generation.degraded;
                response.state = TaskState::Done;
            }
            Err(e) => {
                response.errors.push(e.code().to_string());
                response.state = TaskState::Failed;
            }
        }
        response
    }

    /// Accumulated spend.
    pub async fn costs(&self) -> CostTracker {
        self.costs.read().await.clone()
    }

    /// Slot pool counters per provider.
    pub fn pool_stats(&self) -> BTreeMap<String, PoolStats> {
        self.slots
            .iter()
            .map(|(name, pool)| (provider_dependency(name), pool.stats()))
            .collect()
    }

    /// Start periodic health checks of every provider slot pool.
    pub fn spawn_maintenance(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.slots.values().map(|pool| pool.spawn_maintenance()).collect()
    }
}
