//! Training/scoring service contract
//!
//! The harness never trains or scores anything itself. It reaches the
//! service through [`TrainingService`], which has two backends:
//!
//! - [`MemoryService`]: in-process frames (Arrow) with model metrics from a
//!   pluggable [`Evaluator`]; used for tests and dry runs
//! - [`HttpService`]: REST client for a running cluster
//!
//! # Example
//!
//! ```rust,no_run
//! use oobe_harness::service::{CurveEvaluator, ImportRequest, MemoryService, TrainingService};
//!
//! # async fn example() -> oobe_harness::Result<()> {
//! let service = MemoryService::new(CurveEvaluator::constant(0.08, 0.05));
//! let request = ImportRequest::new("data", "covtype.data", false, "covtype.data.hex");
//! let frame = service.import_parse(&request).await?;
//! println!("{} rows x {} cols", frame.num_rows, frame.num_cols);
//! # Ok(())
//! # }
//! ```

mod http;
mod memory;

pub use http::HttpService;
pub use memory::{CurveEvaluator, Evaluator, FitSummary, MemoryService};

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::config::HyperparameterConfig;
use crate::Result;

/// Handle to a tabular resource held by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHandle {
    /// Service-side key
    pub key: String,
    /// Row count
    pub num_rows: u64,
    /// Column count
    pub num_cols: usize,
}

/// Where to import a dataset from and what to call it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequest {
    /// Storage location of the input file
    pub bucket: String,
    /// Path relative to `bucket`
    pub path: String,
    /// Whether row 0 holds column names
    pub header: bool,
    /// Destination key for the parsed frame
    pub hex_key: String,
}

impl ImportRequest {
    /// Create an import request.
    #[must_use]
    pub fn new(
        bucket: impl Into<String>,
        path: impl Into<String>,
        header: bool,
        hex_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
            header,
            hex_key: hex_key.into(),
        }
    }
}

/// One training call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainRequest {
    /// Frame to train on
    pub data: DatasetHandle,
    /// Training options, passed through unchanged
    pub hyperparameters: HyperparameterConfig,
    /// Key the model is stored under
    pub model_key: String,
    /// Compute the out-of-bag error estimate
    pub out_of_bag: bool,
}

/// One scoring call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreRequest {
    /// Frame to score against
    pub data: DatasetHandle,
    /// Model to score
    pub model_key: String,
    /// Number of trees to use
    pub ntree: u32,
    /// Accumulate the confusion matrix tree by tree
    pub iterative_cm: bool,
    /// Use the out-of-bag estimate instead of full scoring
    pub out_of_bag: bool,
}

/// Record-level classification statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Misclassification rate in `[0, 1]`
    pub classification_error: f64,
    /// Counts, rows = actual class, columns = predicted class
    #[serde(default)]
    pub counts: Option<Vec<Vec<u64>>>,
}

impl ConfusionMatrix {
    /// Matrix with only the error rate.
    #[must_use]
    pub const fn from_error(classification_error: f64) -> Self {
        Self {
            classification_error,
            counts: None,
        }
    }

    /// Sum of all counts, when the counts are known.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        self.counts
            .as_ref()
            .map(|rows| rows.iter().flatten().sum())
    }

    /// Error rate per actual class, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn class_error_pct(&self) -> Vec<f64> {
        let Some(rows) = &self.counts else {
            return Vec::new();
        };
        rows.iter()
            .enumerate()
            .map(|(class, row)| {
                let total: u64 = row.iter().sum();
                if total == 0 {
                    0.0
                } else {
                    let right = row.get(class).copied().unwrap_or(0);
                    100.0 * (total - right) as f64 / total as f64
                }
            })
            .collect()
    }
}

/// Result of a training call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Model key
    pub model_key: String,
    /// Frame the model was trained on
    pub data_key: String,
    /// Trees built
    pub ntree: u32,
    /// Out-of-bag confusion matrix
    pub confusion_matrix: ConfusionMatrix,
}

/// Result of a scoring call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    /// Scored model
    pub model_key: String,
    /// Frame scored against
    pub data_key: String,
    /// Trees used
    pub ntree: u32,
    /// Final confusion matrix
    pub confusion_matrix: ConfusionMatrix,
    /// Classification error after each tree (iterative scoring only)
    pub tree_errors: Vec<f64>,
    /// Records scored
    pub total_scored: u64,
}

/// Handle to generated predictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionHandle {
    /// Service-side key of the prediction frame
    pub key: String,
    /// Rows predicted
    pub num_rows: u64,
}

/// Cluster health as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudStatus {
    /// Cloud name
    pub name: String,
    /// Nodes currently in the cloud
    pub node_count: u32,
    /// Nodes agree on membership and none reports itself unhealthy
    pub healthy: bool,
}

/// What the sampling primitive promises when two filters reuse a seed on
/// the same source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingGuarantee {
    /// Draws with a shared seed never select the same row twice
    Disjoint,
    /// Draws with a shared seed can select overlapping rows
    MayOverlap,
    /// The service makes no statement
    Unknown,
}

/// Operations the harness needs from a training/scoring service.
///
/// Implementations must be deterministic for `random_filter`: the same
/// `(source, rows, seed)` always selects the same rows.
pub trait TrainingService: Send + Sync {
    /// Report cluster membership and health.
    fn cloud_status(&self) -> impl Future<Output = Result<CloudStatus>> + Send;

    /// Import and parse a file into a frame.
    fn import_parse(
        &self,
        request: &ImportRequest,
    ) -> impl Future<Output = Result<DatasetHandle>> + Send;

    /// Look up row and column counts of an existing frame.
    fn inspect(&self, key: &str) -> impl Future<Output = Result<DatasetHandle>> + Send;

    /// Draw `rows` rows pseudorandomly (seeded) into a new frame.
    fn random_filter(
        &self,
        source: &DatasetHandle,
        rows: u64,
        seed: u64,
        dest_key: &str,
    ) -> impl Future<Output = Result<DatasetHandle>> + Send;

    /// Copy rows `start..=end` (1-based) into a new frame.
    fn slice(
        &self,
        source: &DatasetHandle,
        start: u64,
        end: u64,
        dest_key: &str,
    ) -> impl Future<Output = Result<DatasetHandle>> + Send;

    /// Train a model.
    fn train(&self, request: &TrainRequest) -> impl Future<Output = Result<Model>> + Send;

    /// Score a model against a frame.
    fn score(&self, request: &ScoreRequest) -> impl Future<Output = Result<ScoringResult>> + Send;

    /// Generate predictions of a model over a frame.
    fn generate_predictions(
        &self,
        model_key: &str,
        data: &DatasetHandle,
    ) -> impl Future<Output = Result<PredictionHandle>> + Send;

    /// Release a frame, model or prediction.
    ///
    /// No-op if the key doesn't exist.
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Disjointness promise of `random_filter` under a reused seed.
    fn sampling_guarantee(&self) -> SamplingGuarantee {
        SamplingGuarantee::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confusion_matrix_totals() {
        let cm = ConfusionMatrix {
            classification_error: 0.25,
            counts: Some(vec![vec![3, 1], vec![0, 0]]),
        };
        assert_eq!(cm.total(), Some(4));
        assert_eq!(cm.class_error_pct(), vec![25.0, 0.0]);
    }

    #[test]
    fn test_confusion_matrix_without_counts() {
        let cm = ConfusionMatrix::from_error(0.1);
        assert_eq!(cm.total(), None);
        assert!(cm.class_error_pct().is_empty());
    }
}
