//! Crate-wide configuration.
//!
//! Every section has defaults, so a config file only names what it
//! changes:
//!
//! ```json
//! {
//!   "breaker": { "failure_threshold": 5 },
//!   "memory": { "index_path": "~/.hmr/memory.db", "default_dimension": 256 },
//!   "http_providers": [
//!     {
//!       "profile": {
//!         "name": "local",
//!         "cost_per_unit": 0.002,
//!         "context_window": 32000,
//!         "task_affinities": ["GENERATE", "REFACTOR"],
//!         "complexity_tiers": ["SIMPLE", "MODERATE"],
//!         "latency_class": "fast"
//!       },
//!       "client": { "endpoint": "http://localhost:9000/invoke" }
//!     }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::llm::{ClientConfig, ProviderProfile, RouterConfig};
use crate::memory::MemoryConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::resilience::BreakerConfig;
use crate::validation::QualityConfig;

/// An HTTP provider declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    pub profile: ProviderProfile,
    pub client: ClientConfig,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Shared by every dependency breaker
    pub breaker: BreakerConfig,
    pub memory: MemoryConfig,
    pub router: RouterConfig,
    pub quality: QualityConfig,
    pub orchestrator: OrchestratorConfig,
    pub http_providers: Vec<HttpProviderConfig>,
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file; `~` in the path is expanded.
    pub fn from_file(path: impl AsRef<str>) -> Result<Self> {
        let expanded = shellexpand::tilde(path.as_ref());
        let path = Path::new(expanded.as_ref());
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("breaker failure_threshold must be positive".into()));
        }
        if self.breaker.cooldown_ms == 0 {
            return Err(Error::Config("breaker cooldown_ms must be positive".into()));
        }
        self.memory.validate()?;
        self.memory.pool.validate()?;
        self.router.validate()?;
        self.quality.validate()?;
        self.orchestrator.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TaskType;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
        assert_eq!(config.memory.cache_ttl_secs, 300);
        assert_eq!(config.router.max_fallbacks, 2);
        assert_eq!(config.quality.quality_threshold, 80);
        assert_eq!(config.orchestrator.task_deadline_ms, 120_000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CoreConfig::from_json_str(
            r#"{
                "breaker": { "failure_threshold": 5 },
                "router": { "max_fallbacks": 1 },
                "http_providers": [{
                    "profile": {
                        "name": "local",
                        "cost_per_unit": 0.002,
                        "context_window": 32000,
                        "task_affinities": ["GENERATE"],
                        "complexity_tiers": ["SIMPLE"],
                        "latency_class": "fast"
                    },
                    "client": { "endpoint": "http://localhost:9000/invoke" }
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
        assert_eq!(config.router.max_fallbacks, 1);
        assert_eq!(config.router.attempt_timeout_ms, 30_000);
        assert_eq!(config.http_providers.len(), 1);
        assert!(config.http_providers[0].profile.handles(TaskType::Generate));
        assert_eq!(config.http_providers[0].client.timeout_secs, 120);
    }

    #[test]
    fn test_invalid_sections_rejected() {
        assert!(CoreConfig::from_json_str(r#"{"quality": {"quality_threshold": 150}}"#).is_err());
        assert!(CoreConfig::from_json_str(r#"{"breaker": {"failure_threshold": 0}}"#).is_err());
        assert!(
            CoreConfig::from_json_str(r#"{"memory": {"pool": {"min_size": 9, "max_size": 2}}}"#)
                .is_err()
        );
        assert!(matches!(
            CoreConfig::from_json_str("not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_from_file_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let config = CoreConfig::default();
        file.write_all(config.to_json_pretty().unwrap().as_bytes())
            .unwrap();

        let loaded = CoreConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded, config);

        let missing = CoreConfig::from_file("~/.hmr/definitely-missing.json");
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
