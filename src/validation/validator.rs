//! Quality scoring and the single-pass improvement loop.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::llm::{Generation, Router, TaskRequest};

use super::heuristics::{analyze, score_issues, Issue};

/// Warning recorded when the improvement call itself failed.
pub const IMPROVEMENT_FAILED: &str = "improvement_failed";

/// Validator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Scores at or above this skip improvement (default: 80)
    pub quality_threshold: u8,
    /// Issues listed in the improvement request, most severe first
    pub max_issues_in_prompt: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 80,
            max_issues_in_prompt: 10,
        }
    }
}

impl QualityConfig {
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn with_max_issues_in_prompt(mut self, max: usize) -> Self {
        self.max_issues_in_prompt = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.quality_threshold > 100 {
            return Err(Error::Config(format!(
                "quality_threshold {} exceeds 100",
                self.quality_threshold
            )));
        }
        Ok(())
    }
}

/// Score and issues for one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub score: u8,
    pub issues: Vec<Issue>,
    pub passed: bool,
}

/// Result of [`QualityValidator::validate_and_improve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub artifact: String,
    pub quality_score: u8,
    /// Provider that produced the returned artifact
    pub provider_used: String,
    /// Generation plus improvement spend
    pub cost: f64,
    /// The returned artifact came from the improvement pass
    pub improved: bool,
    pub improvement_attempted: bool,
    pub warnings: Vec<String>,
    /// A provider was skipped for an open circuit in either pass
    pub degraded: bool,
}

/// Deterministic heuristic validator.
#[derive(Debug, Clone, Default)]
pub struct QualityValidator {
    config: QualityConfig,
}

impl QualityValidator {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Score `artifact` for `task`.
    pub fn score(&self, artifact: &str, task: &TaskRequest) -> QualityReport {
        let mut issues = analyze(artifact, task.task_type);
        issues.sort_by_key(|i| i.severity);
        let score = score_issues(&issues);
        QualityReport {
            score,
            issues,
            passed: score >= self.config.quality_threshold,
        }
    }

    /// Score a generation and, below threshold, make exactly one
    /// improvement request through `router`.
    ///
    /// The improved artifact replaces the original only when it scores
    /// strictly higher; otherwise the original is returned unchanged with
    /// a `validation_regression` warning. Never fails.
    #[instrument(skip_all, fields(task_type = %task.task_type, provider = %generation.provider_used))]
    pub async fn validate_and_improve(
        &self,
        generation: Generation,
        task: &TaskRequest,
        router: &Router,
        deadline: Option<Instant>,
    ) -> ValidationOutcome {
        let original = self.score(&generation.artifact, task);
        let mut outcome = ValidationOutcome {
            artifact: generation.artifact,
            quality_score: original.score,
            provider_used: generation.provider_used,
            cost: generation.cost,
            improved: false,
            improvement_attempted: false,
            warnings: generation.warnings,
            degraded: generation.degraded,
        };

        if original.passed {
            debug!(score = original.score, "Artifact passed quality threshold");
            return outcome;
        }

        info!(
            score = original.score,
            threshold = self.config.quality_threshold,
            issues = original.issues.len(),
            "Requesting improvement pass"
        );
        outcome.improvement_attempted = true;

        let request = self.improvement_request(task, &outcome.artifact, &original.issues);
        let candidate = match router.generate(&request, &request.description, deadline).await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, "Improvement pass failed, keeping original");
                outcome.warnings.push(IMPROVEMENT_FAILED.to_string());
                return outcome;
            }
        };
        outcome.cost += candidate.cost;
        outcome.degraded |= candidate.degraded;
        for warning in candidate.warnings {
            if !outcome.warnings.contains(&warning) {
                outcome.warnings.push(warning);
            }
        }

        let improved = self.score(&candidate.artifact, task);
        if improved.score > original.score {
            info!(from = original.score, to = improved.score, "Adopted improved artifact");
            outcome.artifact = candidate.artifact;
            outcome.quality_score = improved.score;
            outcome.provider_used = candidate.provider_used;
            outcome.improved = true;
        } else {
            let regression = Error::ValidationRegression {
                original: original.score,
                improved: improved.score,
            };
            warn!(error = %regression, "Keeping original artifact");
            outcome.warnings.push(regression.code().to_string());
        }
        outcome
    }

    /// The task re-issued with the previous artifact and its issues
    /// appended to the description.
    pub fn improvement_request(
        &self,
        task: &TaskRequest,
        artifact: &str,
        issues: &[Issue],
    ) -> TaskRequest {
        let mut description = task.description.clone();
        description.push_str("\n\n## Previous Attempt\n");
        description.push_str(artifact);
        description.push_str("\n\n## Issues To Fix\n");
        for issue in issues.iter().take(self.config.max_issues_in_prompt) {
            description.push_str(&format!("- {}\n", issue));
        }

        let mut request = task.clone();
        request.description = description;
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Provider, ProviderProfile, RouterConfig, TaskType};
    use crate::testing::{router_with, ScriptedProvider};
    use pretty_assertions::assert_eq;

    // todo!() + unwrap + hardcoded key = 100 - 15 - 8 - 30 = 47
    const POOR: &str = "fn f() {\n    let token = \"abcdefghijkl\";\n    x.unwrap();\n    todo!()\n}";
    const GOOD: &str = "/// Adds one.\nfn f(x: i32) -> i32 {\n    x + 1\n}";

    fn generation(artifact: &str) -> Generation {
        Generation {
            artifact: artifact.to_string(),
            provider_used: "first".into(),
            units: 1.0,
            cost: 1.0,
            attempts: 1,
            warnings: Vec::new(),
            degraded: false,
        }
    }

    fn router(provider: std::sync::Arc<ScriptedProvider>) -> Router {
        let name = provider.name().to_string();
        router_with(
            vec![(
                ProviderProfile::new(name, 0.5).with_affinities([TaskType::Generate]),
                provider,
            )],
            RouterConfig::default(),
        )
    }

    fn task() -> TaskRequest {
        TaskRequest::new(TaskType::Generate, "write f")
    }

    #[test]
    fn test_score_is_deterministic() {
        let validator = QualityValidator::default();
        let a = validator.score(POOR, &task());
        let b = validator.score(POOR, &task());
        assert_eq!(a, b);
        assert_eq!(a.score, 47);
        assert!(!a.passed);
    }

    #[test]
    fn test_config_rejects_threshold_over_100() {
        assert!(QualityConfig::default().with_threshold(101).validate().is_err());
        assert!(QualityConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_passing_artifact_is_untouched() {
        let provider = ScriptedProvider::ok("fixer", "unused");
        let router = router(provider.clone());
        let outcome = QualityValidator::default()
            .validate_and_improve(generation(GOOD), &task(), &router, None)
            .await;

        assert_eq!(outcome.artifact, GOOD);
        assert_eq!(outcome.quality_score, 100);
        assert!(!outcome.improvement_attempted);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_better_improvement_is_adopted() {
        let provider = ScriptedProvider::ok("fixer", GOOD);
        let router = router(provider.clone());
        let outcome = QualityValidator::default()
            .validate_and_improve(generation(POOR), &task(), &router, None)
            .await;

        assert!(outcome.improved);
        assert_eq!(outcome.artifact, GOOD);
        assert_eq!(outcome.provider_used, "fixer");
        assert!((outcome.cost - 1.5).abs() < 1e-9);
        assert_eq!(provider.calls(), 1);

        let prompt = &provider.prompts()[0];
        assert!(prompt.starts_with("write f"));
        assert!(prompt.contains(POOR));
        assert!(prompt.contains("hardcoded credential"));
    }

    #[tokio::test]
    async fn test_equal_score_keeps_original_byte_identical() {
        let provider = ScriptedProvider::ok("fixer", POOR);
        let router = router(provider.clone());
        let outcome = QualityValidator::default()
            .validate_and_improve(generation(POOR), &task(), &router, None)
            .await;

        assert!(!outcome.improved);
        assert!(outcome.improvement_attempted);
        assert_eq!(outcome.artifact.as_bytes(), POOR.as_bytes());
        assert_eq!(outcome.quality_score, 47);
        assert_eq!(outcome.provider_used, "first");
        assert_eq!(outcome.warnings, vec!["validation_regression".to_string()]);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_improvement_keeps_original() {
        let provider = ScriptedProvider::failing("fixer");
        let router = router(provider.clone());
        let outcome = QualityValidator::default()
            .validate_and_improve(generation(POOR), &task(), &router, None)
            .await;

        assert_eq!(outcome.artifact, POOR);
        assert_eq!(outcome.warnings, vec![IMPROVEMENT_FAILED.to_string()]);
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_improvement_request_caps_issue_list() {
        let validator = QualityValidator::new(QualityConfig::default().with_max_issues_in_prompt(1));
        let report = validator.score(POOR, &task());
        let request = validator.improvement_request(&task(), POOR, &report.issues);

        assert_eq!(request.task_type, TaskType::Generate);
        assert_eq!(request.description.matches("\n- ").count(), 1);
        // Most severe issue is listed first
        assert!(request.description.contains("critical"));
    }
}
