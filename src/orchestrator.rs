//! Task orchestration state machine.
//!
//! Each submitted task moves strictly sequentially through
//! 1. CONTEXT_RETRIEVAL: search memory for context (non-fatal)
//! 2. GENERATION: route and generate through the [`Router`] (fatal)
//! 3. VALIDATION: score and optionally improve once (never fails)
//! 4. STORAGE: persist the artifact and its embedding (non-fatal)
//!
//! and ends in DONE, or in FAILED when generation is exhausted. No error
//! crosses [`TaskOrchestrator::submit_task`]: every outcome is a
//! [`TaskResponse`].

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::llm::{
    HttpProvider, Provider, ProviderProfile, Registry, RegistryBuilder, Router, TaskRequest,
};
use crate::memory::{
    CacheStore, Embedder, HashEmbedder, HealthReport, IndexBackend, InMemoryCache, MemoryFilter,
    MemoryService, Metadata, ScoredEntry, SqliteIndexBackend,
};
use crate::resilience::{provider_dependency, BreakerRegistry, CACHE_DEPENDENCY, INDEX_DEPENDENCY};
use crate::validation::QualityValidator;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    #[default]
    Received,
    ContextRetrieval,
    Generation,
    Validation,
    Storage,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `next` directly follows this state.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::ContextRetrieval)
                | (Self::ContextRetrieval, Self::Generation)
                | (Self::Generation, Self::Validation)
                | (Self::Generation, Self::Failed)
                | (Self::Validation, Self::Storage)
                | (Self::Storage, Self::Done)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Received => write!(f, "RECEIVED"),
            Self::ContextRetrieval => write!(f, "CONTEXT_RETRIEVAL"),
            Self::Generation => write!(f, "GENERATION"),
            Self::Validation => write!(f, "VALIDATION"),
            Self::Storage => write!(f, "STORAGE"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
}

/// Terminal result of a task. Never mutated once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub success: bool,
    pub artifact: Option<String>,
    /// 0-100, absent when nothing was generated
    pub quality_score: Option<u8>,
    pub provider_used: Option<String>,
    /// Failure codes and warnings, e.g. `all_providers_failed`,
    /// `validation_regression`, `storage_degraded`
    pub errors: Vec<String>,
    /// A dependency was skipped or served from stale cache
    pub degraded: bool,
    pub cost_usd: f64,
    pub state: TaskState,
    pub transitions: Vec<TaskTransition>,
}

impl TaskResponse {
    pub fn new() -> Self {
        Self {
            task_id: Uuid::new_v4(),
            success: false,
            artifact: None,
            quality_score: None,
            provider_used: None,
            errors: Vec::new(),
            degraded: false,
            cost_usd: 0.0,
            state: TaskState::Received,
            transitions: Vec::new(),
        }
    }

    /// Record a transition to `next`.
    fn advance(&mut self, next: TaskState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(task_id = %self.task_id, from = %self.state, to = %next, "Task transition");
        self.transitions.push(TaskTransition {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
    }

    fn warn(&mut self, code: &str) {
        if !self.errors.iter().any(|e| e == code) {
            self.errors.push(code.to_string());
        }
    }
}

impl Default for TaskResponse {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deadline for tasks that do not carry one (default: 120s)
    pub task_deadline_ms: u64,
    /// Tasks processed concurrently by `submit_many`
    pub max_parallel_tasks: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_deadline_ms: 120_000,
            max_parallel_tasks: 8,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_task_deadline(mut self, deadline: Duration) -> Self {
        self.task_deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max;
        self
    }

    pub fn task_deadline(&self) -> Duration {
        Duration::from_millis(self.task_deadline_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_deadline_ms == 0 {
            return Err(Error::Config("task_deadline_ms must be positive".into()));
        }
        if self.max_parallel_tasks == 0 {
            return Err(Error::Config("max_parallel_tasks must be positive".into()));
        }
        Ok(())
    }
}

/// Sequences memory, router and validator per task.
pub struct TaskOrchestrator {
    memory: Arc<MemoryService>,
    router: Arc<Router>,
    validator: QualityValidator,
    embedder: Arc<dyn Embedder>,
    config: OrchestratorConfig,
}

impl TaskOrchestrator {
    pub fn new(
        memory: Arc<MemoryService>,
        router: Arc<Router>,
        validator: QualityValidator,
        embedder: Arc<dyn Embedder>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            memory,
            router,
            validator,
            embedder,
            config,
        })
    }

    pub fn builder(config: CoreConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn memory(&self) -> &Arc<MemoryService> {
        &self.memory
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn validator(&self) -> &QualityValidator {
        &self.validator
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one task to a terminal state.
    #[instrument(skip_all, fields(task_type = %task.task_type, complexity = %task.complexity))]
    pub async fn submit_task(&self, task: TaskRequest) -> TaskResponse {
        let deadline = Instant::now() + task.deadline().unwrap_or(self.config.task_deadline());
        let mut response = TaskResponse::new();
        info!(task_id = %response.task_id, "Task received");

        response.advance(TaskState::ContextRetrieval);
        let context = self.retrieve_context(&task, &mut response).await;

        response.advance(TaskState::Generation);
        let prompt = build_prompt(&task, &context);
        let generation = match self.router.generate(&task, &prompt, Some(deadline)).await {
            Ok(generation) => generation,
            Err(e) => {
                warn!(task_id = %response.task_id, error = %e, "Generation failed");
                response.warn(e.code());
                response.advance(TaskState::Failed);
                return response;
            }
        };

        response.advance(TaskState::Validation);
        let outcome = self
            .validator
            .validate_and_improve(generation, &task, &self.router, Some(deadline))
            .await;
        for warning in &outcome.warnings {
            response.warn(warning);
        }
        response.degraded |= outcome.degraded;
        response.quality_score = Some(outcome.quality_score);
        response.provider_used = Some(outcome.provider_used.clone());
        response.cost_usd = outcome.cost;

        response.advance(TaskState::Storage);
        let mut metadata = Metadata::new();
        metadata.insert("task_id".into(), json!(response.task_id.to_string()));
        metadata.insert("task_type".into(), json!(task.task_type));
        metadata.insert("provider".into(), json!(outcome.provider_used));
        metadata.insert("quality_score".into(), json!(outcome.quality_score));
        metadata.insert("improved".into(), json!(outcome.improved));
        if let Err(e) = self.persist(&outcome.artifact, metadata, &task).await {
            warn!(task_id = %response.task_id, error = %e, "Artifact not stored");
            response.degraded = true;
            response.warn(e.code());
        }

        response.artifact = Some(outcome.artifact);
        response.success = true;
        response.advance(TaskState::Done);
        info!(
            task_id = %response.task_id,
            quality = response.quality_score,
            degraded = response.degraded,
            cost = response.cost_usd,
            "Task done"
        );
        response
    }

    /// Run tasks concurrently, at most `max_parallel_tasks` at a time.
    /// Responses are in input order.
    pub async fn submit_many(&self, tasks: Vec<TaskRequest>) -> Vec<TaskResponse> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_tasks));
        let futures = tasks.into_iter().map(|task| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.ok();
                self.submit_task(task).await
            }
        });
        join_all(futures).await
    }

    /// Memory health merged with provider breaker and pool state.
    pub fn health(&self) -> HealthReport {
        let mut report = self.memory.get_health();
        report.pools.extend(self.router.pool_stats());
        report
    }

    /// Start background health checks for the index and provider pools.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.memory.pool().spawn_maintenance()];
        handles.extend(self.router.spawn_maintenance());
        handles
    }

    async fn retrieve_context(
        &self,
        task: &TaskRequest,
        response: &mut TaskResponse,
    ) -> Vec<ScoredEntry> {
        let default_top_k = self.memory.config().default_top_k;
        let queries: Vec<(String, _, usize, MemoryFilter)> = if task.context_refs.is_empty() {
            vec![(
                task.description.clone(),
                task.storage_collection(),
                default_top_k,
                MemoryFilter::new(),
            )]
        } else {
            task.context_refs
                .iter()
                .map(|r| {
                    (
                        r.query.clone().unwrap_or_else(|| task.description.clone()),
                        r.collection.clone(),
                        r.top_k.unwrap_or(default_top_k),
                        r.filter.clone(),
                    )
                })
                .collect()
        };

        let mut seen = BTreeSet::new();
        let mut context = Vec::new();
        for (query, collection, top_k, filter) in queries {
            let vector = match self.embedder.embed(&query).await {
                Ok(vector) => vector,
                Err(e) => {
                    warn!(error = %e, "Context query embedding failed");
                    response.degraded = true;
                    continue;
                }
            };
            match self.memory.search(&vector, &collection, &filter, top_k).await {
                Ok(outcome) => {
                    if outcome.degraded {
                        debug!(collection = %collection, source = ?outcome.source, "Degraded context");
                        response.degraded = true;
                    }
                    for hit in outcome.results {
                        if seen.insert(hit.entry.id) {
                            context.push(hit);
                        }
                    }
                }
                Err(e) => {
                    warn!(collection = %collection, error = %e, "Context search failed");
                    response.degraded = true;
                }
            }
        }
        context
    }

    async fn persist(&self, artifact: &str, metadata: Metadata, task: &TaskRequest) -> Result<()> {
        let vector = self.embedder.embed(artifact).await?;
        self.memory
            .store(artifact, vector, metadata, task.storage_collection())
            .await
            .map(|_| ())
    }
}

/// The task description followed by retrieved context, best match first.
pub fn build_prompt(task: &TaskRequest, context: &[ScoredEntry]) -> String {
    if context.is_empty() {
        return task.description.clone();
    }
    let mut prompt = task.description.clone();
    prompt.push_str("\n\n## Relevant Context\n");
    for hit in context {
        prompt.push_str(&format!(
            "\n### {} (similarity {:.3})\n{}\n",
            hit.entry.collection, hit.score, hit.entry.content
        ));
    }
    prompt
}

/// Wires a [`TaskOrchestrator`] from a [`CoreConfig`].
///
/// Breakers are registered for the index, the cache and every provider.
/// Unless overridden, the index is SQLite at `memory.index_path`, the
/// cache is in-process and embeddings come from a [`HashEmbedder`] of
/// `memory.default_dimension`.
pub struct OrchestratorBuilder {
    config: CoreConfig,
    registry: RegistryBuilder,
    index: Option<Arc<dyn IndexBackend>>,
    cache: Option<Arc<dyn CacheStore>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl OrchestratorBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            registry: Registry::builder(),
            index: None,
            cache: None,
            embedder: None,
        }
    }

    pub fn with_provider(mut self, profile: ProviderProfile, provider: Arc<dyn Provider>) -> Self {
        self.registry = self.registry.with_provider(profile, provider);
        self
    }

    pub fn with_index_backend(mut self, backend: Arc<dyn IndexBackend>) -> Self {
        self.index = Some(backend);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn build(self) -> Result<TaskOrchestrator> {
        let Self {
            config,
            mut registry,
            index,
            cache,
            embedder,
        } = self;
        config.validate()?;

        for entry in &config.http_providers {
            let provider = HttpProvider::new(entry.profile.name.clone(), entry.client.clone())?;
            registry = registry.with_provider(entry.profile.clone(), Arc::new(provider));
        }
        let registry = registry.build()?;
        if registry.is_empty() {
            return Err(Error::Config("at least one provider is required".into()));
        }

        let mut breakers = BreakerRegistry::new(config.breaker.clone());
        breakers.register(INDEX_DEPENDENCY);
        breakers.register(CACHE_DEPENDENCY);
        for name in registry.names() {
            breakers.register(provider_dependency(name));
        }

        let router = Router::new(Arc::new(registry), &breakers, config.router.clone())?;

        let embedder = match embedder {
            Some(embedder) => embedder,
            None => Arc::new(HashEmbedder::new(config.memory.default_dimension)?),
        };
        for (collection, dimension) in &config.memory.collections {
            if *dimension != embedder.dimension() {
                return Err(Error::Config(format!(
                    "collection '{}' has dimension {} but the embedder produces {}",
                    collection,
                    dimension,
                    embedder.dimension()
                )));
            }
        }

        let index = index.unwrap_or_else(|| {
            Arc::new(SqliteIndexBackend::new(config.memory.resolved_index_path()))
        });
        let cache = cache.unwrap_or_else(|| Arc::new(InMemoryCache::new()));
        let memory = MemoryService::new(config.memory.clone(), index, cache, Arc::new(breakers))?;

        TaskOrchestrator::new(
            Arc::new(memory),
            Arc::new(router),
            QualityValidator::new(config.quality.clone()),
            embedder,
            config.orchestrator.clone(),
        )
    }
}
