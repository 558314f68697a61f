//! Artifact quality validation.
//!
//! [`QualityValidator`] scores artifacts with deterministic static
//! heuristics and drives at most one improvement pass through the
//! [`Router`](crate::llm::Router) when a score falls below threshold.

pub mod heuristics;
mod proptest;
pub mod validator;

pub use heuristics::{Issue, IssueCategory, IssueSeverity};
pub use validator::{
    QualityConfig, QualityReport, QualityValidator, ValidationOutcome, IMPROVEMENT_FAILED,
};
