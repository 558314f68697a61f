//! Per-dependency circuit breaker.
//!
//! States:
//!   Closed   - calls pass through, consecutive failures are counted
//!   Open     - calls fail fast until the cooldown elapses
//!   HalfOpen - exactly one trial call decides Closed or Open again
//!
//! All transitions for one breaker happen under a single mutex. The lock is
//! never held across the guarded call itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Dependency name used for the vector index breaker.
pub const INDEX_DEPENDENCY: &str = "index";

/// Dependency name used for the fast cache breaker.
pub const CACHE_DEPENDENCY: &str = "cache";

/// Breaker name for a registered provider.
pub fn provider_dependency(provider: &str) -> String {
    format!("provider:{}", provider)
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens (default: 3)
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call (default: 30s)
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// How long the circuit has been open, if it is
    pub open_for_ms: Option<u64>,
}

impl CircuitSnapshot {
    /// A dependency is healthy unless its circuit is open.
    pub fn is_healthy(&self) -> bool {
        self.state != CircuitState::Open
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    // Bumped on every trip so outcomes of calls admitted before the trip
    // cannot close or re-open the circuit.
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Admission {
    trial: bool,
    generation: u64,
}

/// A circuit breaker guarding one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State stays consistent even if a holder panicked: every mutation
        // is a plain field store.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` through the breaker.
    ///
    /// Fails fast with [`Error::CircuitOpen`] without invoking `f` while the
    /// circuit is open, or while a half-open trial is already in flight.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let mut guard = CallGuard {
            breaker: self,
            admission,
            settled: false,
        };

        let result = f().await;
        match &result {
            Ok(_) => guard.settle(true, None),
            Err(e) => guard.settle(false, Some(e)),
        }
        result
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission {
                trial: false,
                generation: inner.generation,
            }),
            CircuitState::Open => {
                let cooldown = self.config.cooldown();
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(cooldown);
                if elapsed >= cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(dependency = %self.name, "Circuit half-open, allowing trial call");
                    Ok(Admission {
                        trial: true,
                        generation: inner.generation,
                    })
                } else {
                    let remaining = cooldown - elapsed;
                    Err(Error::circuit_open(
                        self.name.clone(),
                        remaining.as_millis() as u64,
                    ))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Error::circuit_open(self.name.clone(), 0))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Admission {
                        trial: true,
                        generation: inner.generation,
                    })
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        if inner.generation != admission.generation {
            return;
        }
        if admission.trial {
            info!(dependency = %self.name, "Trial call succeeded, circuit closed");
        }
        if admission.trial || inner.state == CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.trial_in_flight = false;
        }
    }

    fn on_failure(&self, admission: Admission, reason: &str) {
        let mut inner = self.lock();
        if inner.generation != admission.generation {
            return;
        }

        if admission.trial {
            self.trip(&mut inner);
            warn!(
                dependency = %self.name,
                reason,
                "Trial call failed, circuit re-opened for {}ms",
                self.config.cooldown_ms
            );
            return;
        }

        if inner.state != CircuitState::Closed {
            return;
        }

        inner.consecutive_failures += 1;
        debug!(
            dependency = %self.name,
            failures = inner.consecutive_failures,
            reason,
            "Dependency call failed"
        );
        if inner.consecutive_failures >= self.config.failure_threshold {
            self.trip(&mut inner);
            warn!(
                dependency = %self.name,
                "Circuit opened after {} consecutive failures, cooling down {}ms",
                inner.consecutive_failures,
                self.config.cooldown_ms
            );
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        inner.generation += 1;
    }

    /// Current state. An open circuit whose cooldown has elapsed still
    /// reports `Open` until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for_ms: match inner.state {
                CircuitState::Closed => None,
                _ => inner.opened_at.map(|at| at.elapsed().as_millis() as u64),
            },
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.generation += 1;
    }
}

/// Settles an admitted call. A call dropped before completing (e.g. its
/// future was cancelled by a deadline) counts as a failure.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, success: bool, error: Option<&Error>) {
        self.settled = true;
        if success {
            self.breaker.on_success(self.admission);
        } else {
            let reason = error.map(|e| e.to_string()).unwrap_or_default();
            self.breaker.on_failure(self.admission, &reason);
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure(self.admission, "call cancelled");
        }
    }
}

/// The fixed set of breakers for a process, one per dependency name.
///
/// Populated once at startup and then shared immutably.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: BTreeMap::new(),
        }
    }

    /// Register a dependency, returning its breaker. Registering the same
    /// name twice returns the existing breaker.
    pub fn register(&mut self, name: impl Into<String>) -> Arc<CircuitBreaker> {
        let name = name.into();
        let config = self.config.clone();
        self.breakers
            .entry(name.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.breakers.keys().map(String::as_str)
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers.values().map(|b| b.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
