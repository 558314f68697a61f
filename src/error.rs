//! Error types for hmr-core.

use thiserror::Error;

/// Result type alias using hmr-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the memory layer and task router.
#[derive(Error, Debug)]
pub enum Error {
    /// A dependency (index, cache, provider) failed transiently
    #[error("Transient failure in {dependency}: {message}")]
    TransientDependency { dependency: String, message: String },

    /// Circuit breaker rejected the call without invoking the dependency
    #[error("Circuit open for {dependency} (retry in {retry_after_ms}ms)")]
    CircuitOpen {
        dependency: String,
        retry_after_ms: u64,
    },

    /// No provider fits the task budget even after downgrade
    #[error("Budget exceeded: ceiling {ceiling:.4} below cheapest estimate {cheapest:.4}")]
    BudgetExceeded { ceiling: f64, cheapest: f64 },

    /// An improvement pass did not score above the original artifact
    #[error("Improved artifact did not beat original: {improved} <= {original}")]
    ValidationRegression { original: u8, improved: u8 },

    /// Every routed provider candidate failed
    #[error("All providers failed after {attempts} attempts: {}", failures.join("; "))]
    AllProvidersFailed {
        attempts: usize,
        failures: Vec<String>,
    },

    /// The task deadline passed before work completed
    #[error("Deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    /// Vector index could not be reached
    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// Store rejected because the index circuit is open
    #[error("Storage degraded: {0}")]
    StorageDegraded(String),

    /// No pooled resource became available in time
    #[error("Pool '{pool}' acquire timed out after {timeout_ms}ms")]
    PoolTimeout { pool: String, timeout_ms: u64 },

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Vector length does not match the collection dimension
    #[error("Collection {collection} expects dimension {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    /// Caller supplied an unusable argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Memory storage error
    #[error("Memory storage error: {0}")]
    MemoryStorage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transient dependency error.
    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Create a circuit open error.
    pub fn circuit_open(dependency: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::CircuitOpen {
            dependency: dependency.into(),
            retry_after_ms,
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a deadline exceeded error.
    pub fn deadline_exceeded(deadline_ms: u64) -> Self {
        Self::DeadlineExceeded { deadline_ms }
    }

    /// Create a pool timeout error.
    pub fn pool_timeout(pool: impl Into<String>, timeout_ms: u64) -> Self {
        Self::PoolTimeout {
            pool: pool.into(),
            timeout_ms,
        }
    }

    /// Whether this is a breaker fast-fail.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether retrying against another dependency may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientDependency { .. }
                | Self::CircuitOpen { .. }
                | Self::IndexUnavailable(_)
                | Self::PoolTimeout { .. }
                | Self::Timeout { .. }
        )
    }

    /// Stable machine-readable code, used in `TaskResponse::errors`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientDependency { .. } => "transient_dependency",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::ValidationRegression { .. } => "validation_regression",
            Self::AllProvidersFailed { .. } => "all_providers_failed",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::IndexUnavailable(_) => "index_unavailable",
            Self::StorageDegraded(_) => "storage_degraded",
            Self::PoolTimeout { .. } => "pool_timeout",
            Self::Timeout { .. } => "timeout",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::InvalidInput(_) => "invalid_input",
            Self::MemoryStorage(_) => "memory_storage",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err = Error::AllProvidersFailed {
            attempts: 3,
            failures: vec!["a: down".into()],
        };
        assert_eq!(err.code(), "all_providers_failed");
        assert_eq!(Error::deadline_exceeded(10).code(), "deadline_exceeded");
        assert_eq!(Error::StorageDegraded("x".into()).code(), "storage_degraded");
    }

    #[test]
    fn test_classification() {
        assert!(Error::circuit_open("index", 100).is_circuit_open());
        assert!(Error::circuit_open("index", 100).is_transient());
        assert!(Error::timeout(5).is_transient());
        assert!(!Error::InvalidInput("bad".into()).is_transient());
    }

    #[test]
    fn test_all_providers_failed_message_lists_failures() {
        let err = Error::AllProvidersFailed {
            attempts: 2,
            failures: vec!["alpha: timeout".into(), "beta: 500".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("alpha: timeout"));
        assert!(msg.contains("beta: 500"));
    }
}
