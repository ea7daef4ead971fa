//! Error types for the harness
//!
//! Every failure carries enough context to say which trial, which metric or
//! which service call stopped the run.

use std::time::Duration;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Harness error types
#[derive(Error, Debug)]
pub enum Error {
    /// A metric fell outside its tolerance band. Fatal: no further trials run.
    #[error(
        "Validation failed on trial {trial}: {metric} expected {expected:.2}, actual {actual:.2} \
         (delta {delta:.2} > tolerance {tolerance:.2})"
    )]
    Validation {
        /// Trial index (1-based)
        trial: usize,
        /// Metric name, e.g. "train accuracy"
        metric: String,
        /// Baseline value
        expected: f64,
        /// Observed value
        actual: f64,
        /// Absolute difference between expected and actual
        delta: f64,
        /// Allowed absolute difference
        tolerance: f64,
    },

    /// A service call exceeded its time bound
    #[error("Service call '{operation}' timed out after {}s", timeout.as_secs())]
    ServiceTimeout {
        /// Operation name
        operation: String,
        /// Bound that was exceeded
        timeout: Duration,
    },

    /// Transient service unavailability (retried only at the score boundary)
    #[error("Service unavailable during '{operation}' after {attempts} attempt(s): {message}")]
    ServiceUnavailable {
        /// Operation name
        operation: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Last failure message
        message: String,
    },

    /// Malformed configuration or missing dataset at setup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Non-transient failure reported by the service
    #[error("Service error during '{operation}': {message}")]
    Service {
        /// Operation name
        operation: String,
        /// Failure message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow/Parquet error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a service error for the given operation.
    pub fn service(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a (single attempt) unavailability error for the given operation.
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            operation: operation.into(),
            attempts: 1,
            message: message.into(),
        }
    }

    /// Whether the error is transient and may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }

    /// Trial index for validation failures.
    #[must_use]
    pub const fn failed_trial(&self) -> Option<usize> {
        match self {
            Self::Validation { trial, .. } => Some(*trial),
            _ => None,
        }
    }
}
