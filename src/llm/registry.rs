//! Provider registry.
//!
//! Built once at startup and shared by reference; the provider list and
//! profiles never change afterwards.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::resilience::ResourceFactory;

use super::client::Provider;
use super::types::ProviderProfile;

/// A profile together with the backend it describes.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub profile: ProviderProfile,
    pub provider: Arc<dyn Provider>,
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// Ordered, immutable set of providers.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<RegisteredProvider>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Profiles in registration order.
    pub fn profiles(&self) -> impl Iterator<Item = &ProviderProfile> {
        self.entries.iter().map(|e| &e.profile)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.profile.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredProvider> {
        self.entries.iter().find(|e| e.profile.name == name)
    }

    pub fn profile(&self, name: &str) -> Option<&ProviderProfile> {
        self.get(name).map(|e| &e.profile)
    }

    /// Lowest-cost provider; registration order breaks ties.
    pub fn cheapest(&self) -> Option<&ProviderProfile> {
        self.profiles()
            .min_by(|a, b| a.cost_per_unit.total_cmp(&b.cost_per_unit))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects providers and validates them into a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<RegisteredProvider>,
}

impl RegistryBuilder {
    pub fn with_provider(mut self, profile: ProviderProfile, provider: Arc<dyn Provider>) -> Self {
        self.entries.push(RegisteredProvider { profile, provider });
        self
    }

    pub fn build(self) -> Result<Registry> {
        let mut seen = BTreeSet::new();
        for entry in &self.entries {
            let name = &entry.profile.name;
            if name.is_empty() {
                return Err(Error::Config("provider name must not be empty".into()));
            }
            if !seen.insert(name.clone()) {
                return Err(Error::Config(format!("provider '{}' registered twice", name)));
            }
            if entry.provider.name() != name {
                return Err(Error::Config(format!(
                    "profile '{}' registered with provider '{}'",
                    name,
                    entry.provider.name()
                )));
            }
            if !entry.profile.cost_per_unit.is_finite() || entry.profile.cost_per_unit < 0.0 {
                return Err(Error::Config(format!(
                    "provider '{}' has invalid cost_per_unit {}",
                    name, entry.profile.cost_per_unit
                )));
            }
        }
        Ok(Registry {
            entries: self.entries,
        })
    }
}

/// Pool factory handing out call slots for one provider.
///
/// Each pooled resource is a shared handle to the same backend; the pool
/// bounds how many calls to that backend are in flight.
pub struct ProviderSlots {
    provider: Arc<dyn Provider>,
}

impl ProviderSlots {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ResourceFactory for ProviderSlots {
    type Resource = Arc<dyn Provider>;

    async fn create(&self) -> Result<Arc<dyn Provider>> {
        Ok(Arc::clone(&self.provider))
    }

    async fn is_healthy(&self, resource: &Arc<dyn Provider>) -> bool {
        resource.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Complexity, TaskType};
    use crate::testing::ScriptedProvider;

    fn profile(name: &str, cost: f64) -> ProviderProfile {
        ProviderProfile::new(name, cost)
            .with_affinities([TaskType::Generate])
            .with_tiers([Complexity::Simple])
    }

    #[test]
    fn test_registry_keeps_order_and_finds_cheapest() {
        let registry = Registry::builder()
            .with_provider(profile("b", 2.0), ScriptedProvider::ok("b", "x"))
            .with_provider(profile("a", 1.0), ScriptedProvider::ok("a", "x"))
            .with_provider(profile("c", 1.0), ScriptedProvider::ok("c", "x"))
            .build()
            .unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["b", "a", "c"]);
        assert_eq!(registry.cheapest().unwrap().name, "a");
        assert!(registry.get("c").is_some());
        assert!(registry.profile("missing").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = Registry::builder()
            .with_provider(profile("a", 1.0), ScriptedProvider::ok("a", "x"))
            .with_provider(profile("a", 2.0), ScriptedProvider::ok("a", "y"))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_mismatched_provider_name_rejected() {
        let result = Registry::builder()
            .with_provider(profile("a", 1.0), ScriptedProvider::ok("b", "x"))
            .build();
        assert!(result.is_err());

        let result = Registry::builder()
            .with_provider(profile("a", -1.0), ScriptedProvider::ok("a", "x"))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_slots_share_provider() {
        let provider = ScriptedProvider::ok("a", "x");
        let slots = ProviderSlots::new(provider.clone());
        let slot = slots.create().await.unwrap();
        assert_eq!(slot.name(), "a");
        assert!(slots.is_healthy(&slot).await);
    }
}
