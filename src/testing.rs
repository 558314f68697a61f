//! Test doubles shared by unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::llm::{Completion, Provider, ProviderProfile, Registry, Router, RouterConfig, TaskHint};
use crate::memory::{
    rank_entries, Collection, IndexBackend, MemoryEntry, MemoryFilter, MemoryId, ScoredEntry,
    VectorIndex,
};
use crate::resilience::{provider_dependency, BreakerConfig, BreakerRegistry};

/// Pauses one search after it has read the index.
#[derive(Clone, Default)]
pub struct SearchGate {
    /// Notified once the search has its results
    pub entered: Arc<Notify>,
    /// Lets the search return
    pub release: Arc<Notify>,
}

#[derive(Default)]
struct FakeIndexState {
    gate: Mutex<Option<SearchGate>>,
    entries: Mutex<Vec<MemoryEntry>>,
    failing: AtomicBool,
    stores_failing: AtomicBool,
    search_calls: AtomicUsize,
    store_calls: AtomicUsize,
}

/// In-memory index whose failures can be switched on and off.
///
/// Clones share state, so a test can keep a handle after passing one to
/// the service.
#[derive(Clone, Default)]
pub struct FakeIndexBackend {
    state: Arc<FakeIndexState>,
}

impl FakeIndexBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every store, search and ping.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail stores only.
    pub fn set_stores_failing(&self, failing: bool) {
        self.state.stores_failing.store(failing, Ordering::SeqCst);
    }

    pub fn search_calls(&self) -> usize {
        self.state.search_calls.load(Ordering::SeqCst)
    }

    pub fn store_calls(&self) -> usize {
        self.state.store_calls.load(Ordering::SeqCst)
    }

    /// Hold the next search between reading and returning.
    pub fn gate_next_search(&self) -> SearchGate {
        let gate = SearchGate::default();
        *self.state.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.state.entries.lock().unwrap().clone()
    }
}

struct FakeIndex {
    state: Arc<FakeIndexState>,
}

impl FakeIndex {
    fn check(&self) -> Result<()> {
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(Error::IndexUnavailable("fake index down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for FakeIndex {
    async fn store(&self, entry: &MemoryEntry) -> Result<MemoryId> {
        self.state.store_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if self.state.stores_failing.load(Ordering::SeqCst) {
            return Err(Error::IndexUnavailable("fake index rejects writes".into()));
        }
        self.state.entries.lock().unwrap().push(entry.clone());
        Ok(entry.id)
    }

    async fn search(
        &self,
        collection: &Collection,
        vector: &[f32],
        top_k: usize,
        filter: &MemoryFilter,
    ) -> Result<Vec<ScoredEntry>> {
        self.state.search_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let ranked = {
            let entries = self.state.entries.lock().unwrap();
            rank_entries(
                entries.iter().filter(|e| &e.collection == collection),
                vector,
                top_k,
                filter,
            )
        };
        let gate = self.state.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(ranked)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[async_trait]
impl IndexBackend for FakeIndexBackend {
    async fn connect(&self) -> Result<Box<dyn VectorIndex>> {
        Ok(Box::new(FakeIndex {
            state: Arc::clone(&self.state),
        }))
    }
}

enum Script {
    Respond(Vec<String>),
    Echo,
    Fail,
    Slow(Duration),
}

/// Provider returning canned artifacts and recording every prompt.
pub struct ScriptedProvider {
    name: String,
    script: Script,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn with_script(name: &str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Always returns `artifact`.
    pub fn ok(name: &str, artifact: &str) -> Arc<Self> {
        Self::with_script(name, Script::Respond(vec![artifact.to_string()]))
    }

    /// Returns each artifact in turn, then repeats the last.
    pub fn sequence(name: &str, artifacts: &[&str]) -> Arc<Self> {
        Self::with_script(
            name,
            Script::Respond(artifacts.iter().map(|a| a.to_string()).collect()),
        )
    }

    /// Returns the prompt it was given.
    pub fn echo(name: &str) -> Arc<Self> {
        Self::with_script(name, Script::Echo)
    }

    /// Always fails with a transient error.
    pub fn failing(name: &str) -> Arc<Self> {
        Self::with_script(name, Script::Fail)
    }

    /// Sleeps for `delay` before answering.
    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Self::with_script(name, Script::Slow(delay))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &str, _hint: &TaskHint) -> Result<Completion> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        match &self.script {
            Script::Respond(artifacts) => {
                let idx = call.min(artifacts.len().saturating_sub(1));
                Ok(Completion::new(artifacts.get(idx).cloned().unwrap_or_default()))
            }
            Script::Echo => Ok(Completion::new(prompt)),
            Script::Fail => Err(Error::transient(
                provider_dependency(&self.name),
                "scripted failure",
            )),
            Script::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(Completion::new(format!("{} finished", self.name)))
            }
        }
    }
}

/// Breakers for every named dependency with default settings.
pub fn breakers_for<'a>(names: impl IntoIterator<Item = &'a str>) -> BreakerRegistry {
    let mut registry = BreakerRegistry::new(BreakerConfig::default());
    for name in names {
        registry.register(name);
    }
    registry
}

/// Router over scripted providers, each with a default breaker.
pub fn router_with(
    providers: Vec<(ProviderProfile, Arc<ScriptedProvider>)>,
    config: RouterConfig,
) -> Router {
    let dependencies: Vec<String> = providers
        .iter()
        .map(|(profile, _)| provider_dependency(&profile.name))
        .collect();
    let breakers = breakers_for(dependencies.iter().map(String::as_str));

    let mut builder = Registry::builder();
    for (profile, provider) in providers {
        builder = builder.with_provider(profile, provider);
    }
    let registry = builder.build().expect("valid test registry");
    Router::new(Arc::new(registry), &breakers, config).expect("valid test router")
}
