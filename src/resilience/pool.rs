//! Bounded resource pool with scoped checkout.
//!
//! Outstanding handles are capped by a semaphore of `max_size` permits; each
//! [`Pooled`] guard owns one permit and returns its resource to the idle list
//! when dropped, so release happens on every exit path including `?` and
//! cancellation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default minimum number of idle resources kept warm.
pub const POOL_SIZE_MIN_DEFAULT: usize = 1;

/// Default maximum number of outstanding resources.
pub const POOL_SIZE_MAX_DEFAULT: usize = 8;

/// Default acquire timeout (5 seconds).
pub const POOL_ACQUIRE_TIMEOUT_MS_DEFAULT: u64 = 5_000;

/// Creates and health-checks pooled resources.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Open a new resource (connection, client, ...).
    async fn create(&self) -> Result<Self::Resource>;

    /// Check an idle resource. Broken resources are evicted and replaced.
    async fn is_healthy(&self, _resource: &Self::Resource) -> bool {
        true
    }
}

/// Pool sizing and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum number of idle resources to keep warm
    pub min_size: usize,
    /// Maximum number of concurrently outstanding resources
    pub max_size: usize,
    /// Timeout for acquiring a resource
    pub acquire_timeout_ms: u64,
    /// How often the maintenance task checks idle resources
    pub health_check_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: POOL_SIZE_MIN_DEFAULT,
            max_size: POOL_SIZE_MAX_DEFAULT,
            acquire_timeout_ms: POOL_ACQUIRE_TIMEOUT_MS_DEFAULT,
            health_check_interval_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("pool max_size must be greater than 0".into()));
        }
        if self.min_size > self.max_size {
            return Err(Error::Config(format!(
                "pool min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(Error::Config("pool acquire_timeout_ms must be positive".into()));
        }
        if self.health_check_interval_ms == 0 {
            return Err(Error::Config("pool health_check_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Pool counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
    pub total_created: u64,
    pub total_acquired: u64,
    pub total_returned: u64,
    pub total_evicted: u64,
    pub acquire_timeouts: u64,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    acquired: AtomicU64,
    returned: AtomicU64,
    evicted: AtomicU64,
    timeouts: AtomicU64,
}

/// A bounded pool of resources produced by a [`ResourceFactory`].
pub struct ResourcePool<F: ResourceFactory> {
    name: String,
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<F::Resource>>,
    capacity: Arc<Semaphore>,
    counters: PoolCounters,
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(name: impl Into<String>, factory: F, config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            name: name.into(),
            factory,
            capacity: Arc::new(Semaphore::new(config.max_size)),
            config,
            idle: Mutex::new(VecDeque::new()),
            counters: PoolCounters::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<F::Resource>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fill the idle list up to `min_size`.
    pub async fn warm_up(&self) -> Result<()> {
        let missing = self.config.min_size.saturating_sub(self.idle().len());
        for _ in 0..missing {
            let resource = self.create_resource().await?;
            self.idle().push_back(resource);
        }
        Ok(())
    }

    /// Acquire a resource using the configured timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<Pooled<F>> {
        self.acquire_timeout(self.config.acquire_timeout()).await
    }

    /// Acquire a resource, waiting at most `timeout` for capacity and
    /// creation combined.
    pub async fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Result<Pooled<F>> {
        let started = Instant::now();
        let timeout_ms = timeout.as_millis() as u64;

        let permit = match tokio::time::timeout(timeout, self.capacity.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Internal(format!("pool '{}' closed", self.name))),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::pool_timeout(self.name.clone(), timeout_ms));
            }
        };

        let reused = self.idle().pop_front();
        let resource = match reused {
            Some(resource) => resource,
            None => {
                let remaining = timeout.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, self.create_resource()).await {
                    Ok(result) => result?,
                    Err(_) => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::pool_timeout(self.name.clone(), timeout_ms));
                    }
                }
            }
        };

        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(Pooled {
            resource: Some(resource),
            pool: Arc::clone(self),
            broken: false,
            _permit: permit,
        })
    }

    /// Return a resource explicitly. Equivalent to dropping the guard.
    pub fn release(&self, handle: Pooled<F>) {
        drop(handle);
    }

    fn give_back(&self, resource: F::Resource, broken: bool) {
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        if broken {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %self.name, "Discarded broken resource");
            return;
        }
        let mut idle = self.idle();
        if idle.len() < self.config.max_size {
            idle.push_back(resource);
        }
    }

    async fn create_resource(&self) -> Result<F::Resource> {
        let resource = self.factory.create().await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(resource)
    }

    /// Check every idle resource, evict broken ones and refill to `min_size`.
    ///
    /// Returns the number of evicted resources.
    pub async fn run_health_check(&self) -> usize {
        let drained: Vec<F::Resource> = self.idle().drain(..).collect();

        let mut healthy = Vec::with_capacity(drained.len());
        let mut evicted = 0;
        for resource in drained {
            if self.factory.is_healthy(&resource).await {
                healthy.push(resource);
            } else {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            warn!(pool = %self.name, evicted, "Evicted broken idle resources");
        }

        let outstanding = self.config.max_size - self.capacity.available_permits();
        while healthy.len() < self.config.min_size
            && healthy.len() + outstanding < self.config.max_size
        {
            match self.create_resource().await {
                Ok(resource) => healthy.push(resource),
                Err(e) => {
                    warn!(pool = %self.name, error = %e, "Failed to replace pooled resource");
                    break;
                }
            }
        }

        self.idle().extend(healthy);
        evicted
    }

    /// Run [`run_health_check`](Self::run_health_check) periodically until
    /// the pool is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                pool.run_health_check().await;
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle().len();
        PoolStats {
            idle,
            in_use: self.config.max_size - self.capacity.available_permits(),
            max_size: self.config.max_size,
            total_created: self.counters.created.load(Ordering::Relaxed),
            total_acquired: self.counters.acquired.load(Ordering::Relaxed),
            total_returned: self.counters.returned.load(Ordering::Relaxed),
            total_evicted: self.counters.evicted.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out resource. Returns to its pool on drop.
pub struct Pooled<F: ResourceFactory> {
    resource: Option<F::Resource>,
    pool: Arc<ResourcePool<F>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<F: ResourceFactory> Pooled<F> {
    /// Mark the resource broken so it is evicted instead of reused.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<F: ResourceFactory> Deref for Pooled<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource is only taken on drop"),
        }
    }
}

impl<F: ResourceFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource is only taken on drop"),
        }
    }
}

impl<F: ResourceFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.give_back(resource, self.broken);
        }
        // The permit field drops after this, freeing capacity.
    }
}
