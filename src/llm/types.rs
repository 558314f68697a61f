//! Task and provider types for routing decisions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::memory::{Collection, MemoryFilter};

/// Kind of work a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Generate,
    Refactor,
    Review,
    Analyze,
    Document,
    Test,
}

impl TaskType {
    /// Whether the task produces code (as opposed to prose).
    pub fn produces_code(&self) -> bool {
        matches!(self, Self::Generate | Self::Refactor | Self::Test)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Refactor => write!(f, "refactor"),
            Self::Review => write!(f, "review"),
            Self::Analyze => write!(f, "analyze"),
            Self::Document => write!(f, "document"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Task complexity, ordered from cheapest to hardest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Architecture,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
            Self::Architecture => write!(f, "architecture"),
        }
    }
}

/// Declared response latency of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Fast,
    Standard,
    Slow,
}

/// Cost and capability profile of a provider. Read-only once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    /// Cost in USD per unit (1K tokens)
    pub cost_per_unit: f64,
    /// Maximum context window (tokens)
    pub context_window: u32,
    pub task_affinities: BTreeSet<TaskType>,
    pub complexity_tiers: BTreeSet<Complexity>,
    pub latency_class: LatencyClass,
}

impl ProviderProfile {
    pub fn new(name: impl Into<String>, cost_per_unit: f64) -> Self {
        Self {
            name: name.into(),
            cost_per_unit,
            context_window: 128_000,
            task_affinities: BTreeSet::new(),
            complexity_tiers: BTreeSet::new(),
            latency_class: LatencyClass::Standard,
        }
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_affinities(mut self, tasks: impl IntoIterator<Item = TaskType>) -> Self {
        self.task_affinities.extend(tasks);
        self
    }

    pub fn with_tiers(mut self, tiers: impl IntoIterator<Item = Complexity>) -> Self {
        self.complexity_tiers.extend(tiers);
        self
    }

    pub fn with_latency(mut self, latency: LatencyClass) -> Self {
        self.latency_class = latency;
        self
    }

    pub fn handles(&self, task_type: TaskType) -> bool {
        self.task_affinities.contains(&task_type)
    }

    pub fn supports(&self, complexity: Complexity) -> bool {
        self.complexity_tiers.contains(&complexity)
    }

    /// Estimated cost for the given number of units.
    pub fn estimate_cost(&self, units: f64) -> f64 {
        units * self.cost_per_unit
    }
}

/// A memory lookup to run before generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    pub collection: Collection,
    /// Query text; the task description is used when absent
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filter: MemoryFilter,
}

impl ContextRef {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            query: None,
            top_k: None,
            filter: MemoryFilter::default(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_filter(mut self, filter: MemoryFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: TaskType,
    pub description: String,
    #[serde(default)]
    pub context_refs: Vec<ContextRef>,
    pub complexity: Complexity,
    /// Maximum acceptable cost in USD
    #[serde(default)]
    pub budget_ceiling: Option<f64>,
    /// Overall deadline; the orchestrator default applies when absent
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Where the artifact is stored; derived from `task_type` when absent
    #[serde(default)]
    pub output_collection: Option<Collection>,
}

impl TaskRequest {
    pub fn new(task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            task_type,
            description: description.into(),
            context_refs: Vec::new(),
            complexity: Complexity::Moderate,
            budget_ceiling: None,
            deadline_ms: None,
            output_collection: None,
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_context(mut self, context: ContextRef) -> Self {
        self.context_refs.push(context);
        self
    }

    pub fn with_budget(mut self, ceiling: f64) -> Self {
        self.budget_ceiling = Some(ceiling);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn with_output_collection(mut self, collection: Collection) -> Self {
        self.output_collection = Some(collection);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Collection the artifact is written to.
    pub fn storage_collection(&self) -> Collection {
        match &self.output_collection {
            Some(collection) => collection.clone(),
            None if self.task_type.produces_code() => Collection::code(),
            None => Collection::knowledge(),
        }
    }

    /// Rough size in units (1K tokens, ~4 chars per token), at least one.
    pub fn estimated_units(&self) -> f64 {
        let tokens = self.description.chars().count() as f64 / 4.0;
        (tokens / 1000.0).ceil().max(1.0)
    }

    pub fn hint(&self) -> TaskHint {
        TaskHint {
            task_type: self.task_type,
            complexity: self.complexity,
            budget_ceiling: self.budget_ceiling,
        }
    }
}

/// What a provider is told about the task besides the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskHint {
    pub task_type: TaskType,
    pub complexity: Complexity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_ceiling: Option<f64>,
}

/// Raw provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub artifact: String,
    /// Units consumed, when the provider reports them
    #[serde(default)]
    pub units_used: Option<f64>,
}

impl Completion {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            units_used: None,
        }
    }

    pub fn with_units(mut self, units: f64) -> Self {
        self.units_used = Some(units);
        self
    }
}

/// Cost tracking across providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTracker {
    /// Total units consumed
    pub total_units: f64,
    /// Total cost in USD
    pub total_cost: f64,
    /// Number of successful calls
    pub request_count: u64,
    /// Number of failed calls
    pub failure_count: u64,
    /// Per-provider breakdown
    pub by_provider: BTreeMap<String, ProviderCosts>,
}

/// Costs for a specific provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCosts {
    pub units: f64,
    pub cost: f64,
    pub request_count: u64,
    pub failure_count: u64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful call.
    pub fn record(&mut self, provider: &str, units: f64, cost: f64) {
        self.total_units += units;
        self.total_cost += cost;
        self.request_count += 1;

        let costs = self.by_provider.entry(provider.to_string()).or_default();
        costs.units += units;
        costs.cost += cost;
        costs.request_count += 1;
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, provider: &str) {
        self.failure_count += 1;
        self.by_provider
            .entry(provider.to_string())
            .or_default()
            .failure_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complexity_ordering() {
        assert!(Complexity::Simple < Complexity::Moderate);
        assert!(Complexity::Complex < Complexity::Architecture);
    }

    #[test]
    fn test_profile_builder() {
        let profile = ProviderProfile::new("alpha", 0.5)
            .with_affinities([TaskType::Generate, TaskType::Review])
            .with_tiers([Complexity::Simple])
            .with_latency(LatencyClass::Fast);

        assert!(profile.handles(TaskType::Review));
        assert!(!profile.handles(TaskType::Document));
        assert!(profile.supports(Complexity::Simple));
        assert!(!profile.supports(Complexity::Architecture));
        assert!((profile.estimate_cost(3.0) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_estimated_units() {
        assert_eq!(TaskRequest::new(TaskType::Generate, "short").estimated_units(), 1.0);
        let long = "x".repeat(4_001 * 4);
        assert_eq!(TaskRequest::new(TaskType::Generate, long).estimated_units(), 5.0);
    }

    #[test]
    fn test_storage_collection() {
        assert_eq!(
            TaskRequest::new(TaskType::Refactor, "x").storage_collection(),
            Collection::code()
        );
        assert_eq!(
            TaskRequest::new(TaskType::Review, "x").storage_collection(),
            Collection::knowledge()
        );
        let explicit = TaskRequest::new(TaskType::Review, "x")
            .with_output_collection(Collection::business());
        assert_eq!(explicit.storage_collection(), Collection::business());
    }

    #[test]
    fn test_task_request_from_json() {
        let task: TaskRequest = serde_json::from_str(
            r#"{"task_type": "ANALYZE", "description": "why", "complexity": "COMPLEX"}"#,
        )
        .unwrap();
        assert_eq!(task.task_type, TaskType::Analyze);
        assert_eq!(task.complexity, Complexity::Complex);
        assert!(task.context_refs.is_empty());
        assert!(task.budget_ceiling.is_none());
    }

    #[test]
    fn test_cost_tracker() {
        let mut tracker = CostTracker::new();
        tracker.record("alpha", 2.0, 0.02);
        tracker.record("alpha", 1.0, 0.01);
        tracker.record_failure("beta");

        assert_eq!(tracker.request_count, 2);
        assert_eq!(tracker.failure_count, 1);
        assert!((tracker.total_cost - 0.03).abs() < 1e-9);
        assert_eq!(tracker.by_provider["alpha"].request_count, 2);
        assert_eq!(tracker.by_provider["beta"].failure_count, 1);
    }
}
