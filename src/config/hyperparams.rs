//! Random-forest training options passed through to the service
//!
//! The harness never interprets these; it only guarantees they are
//! well-formed and identical for every trial.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Depth used to mean "no depth limit".
pub const UNBOUNDED_DEPTH: u32 = 2_147_483_647;

/// Split-quality statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatType {
    /// Information gain (entropy)
    #[default]
    Entropy,
    /// Gini impurity
    Gini,
}

impl StatType {
    /// Wire name understood by the service.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entropy => "ENTROPY",
            Self::Gini => "GINI",
        }
    }
}

/// Immutable training options, fixed across all trials.
///
/// Deserialization rejects unknown fields; missing fields fall back to the
/// covtype baseline values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HyperparameterConfig {
    response_column: usize,
    ignored_columns: BTreeSet<usize>,
    ntree: u32,
    max_depth: u32,
    bin_limit: u32,
    parallel: bool,
    sample_pct: u8,
    exclusive_split_limit: u32,
    stat_type: StatType,
    class_weights: Option<String>,
    seed: Option<u64>,
    features: Option<u32>,
}

impl Default for HyperparameterConfig {
    fn default() -> Self {
        Self {
            response_column: 54,
            ignored_columns: [1, 2, 6, 7, 8].into_iter().collect(),
            ntree: 10,
            max_depth: UNBOUNDED_DEPTH,
            bin_limit: 10_000,
            parallel: true,
            sample_pct: 66,
            exclusive_split_limit: 0,
            stat_type: StatType::Entropy,
            class_weights: None,
            seed: None,
            features: None,
        }
    }
}

impl HyperparameterConfig {
    /// Create a builder starting from the baseline values.
    #[must_use]
    pub fn builder() -> HyperparameterConfigBuilder {
        HyperparameterConfigBuilder::default()
    }

    /// Check field ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first offending field.
    pub fn verify(&self) -> Result<()> {
        if self.ntree == 0 {
            return Err(invalid("ntree", "must be at least 1"));
        }
        if self.max_depth == 0 {
            return Err(invalid("max_depth", "must be at least 1"));
        }
        if self.bin_limit < 2 {
            return Err(invalid("bin_limit", "must be at least 2"));
        }
        if !(1..=100).contains(&self.sample_pct) {
            return Err(invalid("sample_pct", "must be within 1..=100"));
        }
        if self.ignored_columns.contains(&self.response_column) {
            return Err(invalid(
                "ignored_columns",
                &format!("contains the response column {}", self.response_column),
            ));
        }
        if self.features == Some(0) {
            return Err(invalid("features", "must be at least 1 when set"));
        }
        Ok(())
    }

    /// Parse from JSON, rejecting unknown fields and invalid values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on parse or validation failure.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| Error::Configuration(format!("hyperparameters: {e}")))?;
        config.verify()?;
        Ok(config)
    }

    /// Response column index.
    #[must_use]
    pub const fn response_column(&self) -> usize {
        self.response_column
    }

    /// Columns excluded from training.
    #[must_use]
    pub const fn ignored_columns(&self) -> &BTreeSet<usize> {
        &self.ignored_columns
    }

    /// Number of trees.
    #[must_use]
    pub const fn ntree(&self) -> u32 {
        self.ntree
    }

    /// Maximum tree depth.
    #[must_use]
    pub const fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Histogram bin limit.
    #[must_use]
    pub const fn bin_limit(&self) -> u32 {
        self.bin_limit
    }

    /// Whether trees are built in parallel.
    #[must_use]
    pub const fn parallel(&self) -> bool {
        self.parallel
    }

    /// Per-tree row sample percentage.
    #[must_use]
    pub const fn sample_pct(&self) -> u8 {
        self.sample_pct
    }

    /// Split-exclusivity threshold.
    #[must_use]
    pub const fn exclusive_split_limit(&self) -> u32 {
        self.exclusive_split_limit
    }

    /// Split-quality statistic.
    #[must_use]
    pub const fn stat_type(&self) -> StatType {
        self.stat_type
    }

    /// Class weights in the service's `class:weight,...` form.
    #[must_use]
    pub fn class_weights(&self) -> Option<&str> {
        self.class_weights.as_deref()
    }

    /// Service-side RNG seed.
    #[must_use]
    pub const fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Features sampled per split.
    #[must_use]
    pub const fn features(&self) -> Option<u32> {
        self.features
    }

    /// Flatten into the service's query parameters.
    #[must_use]
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let ignore = self
            .ignored_columns
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut params = vec![
            ("response_variable", self.response_column.to_string()),
            ("ntree", self.ntree.to_string()),
            ("depth", self.max_depth.to_string()),
            ("bin_limit", self.bin_limit.to_string()),
            ("parallel", u8::from(self.parallel).to_string()),
            ("sample", self.sample_pct.to_string()),
            ("exclusive_split_limit", self.exclusive_split_limit.to_string()),
            ("stat_type", self.stat_type.as_str().to_string()),
        ];
        if !ignore.is_empty() {
            params.push(("ignore", ignore));
        }
        if let Some(weights) = &self.class_weights {
            params.push(("class_weights", weights.clone()));
        }
        if let Some(seed) = self.seed {
            params.push(("seed", seed.to_string()));
        }
        if let Some(features) = self.features {
            params.push(("features", features.to_string()));
        }
        params
    }

    /// Train/score timeout in seconds: `30 + ntree * 20`.
    #[must_use]
    pub const fn timeout_secs(&self) -> u64 {
        30 + self.ntree as u64 * 20
    }
}

fn invalid(field: &str, reason: &str) -> Error {
    Error::Configuration(format!("hyperparameter '{field}' {reason}"))
}

/// Builder for `HyperparameterConfig`.
#[derive(Debug, Default)]
pub struct HyperparameterConfigBuilder {
    inner: HyperparameterConfig,
}

impl HyperparameterConfigBuilder {
    /// Set the response column index.
    #[must_use]
    pub const fn response_column(mut self, column: usize) -> Self {
        self.inner.response_column = column;
        self
    }

    /// Replace the set of ignored columns.
    #[must_use]
    pub fn ignored_columns(mut self, columns: impl IntoIterator<Item = usize>) -> Self {
        self.inner.ignored_columns = columns.into_iter().collect();
        self
    }

    /// Set the number of trees.
    #[must_use]
    pub const fn ntree(mut self, ntree: u32) -> Self {
        self.inner.ntree = ntree;
        self
    }

    /// Set the maximum depth.
    #[must_use]
    pub const fn max_depth(mut self, depth: u32) -> Self {
        self.inner.max_depth = depth;
        self
    }

    /// Set the histogram bin limit.
    #[must_use]
    pub const fn bin_limit(mut self, limit: u32) -> Self {
        self.inner.bin_limit = limit;
        self
    }

    /// Build trees in parallel or not.
    #[must_use]
    pub const fn parallel(mut self, parallel: bool) -> Self {
        self.inner.parallel = parallel;
        self
    }

    /// Set the per-tree sample percentage.
    #[must_use]
    pub const fn sample_pct(mut self, pct: u8) -> Self {
        self.inner.sample_pct = pct;
        self
    }

    /// Set the split-exclusivity threshold.
    #[must_use]
    pub const fn exclusive_split_limit(mut self, limit: u32) -> Self {
        self.inner.exclusive_split_limit = limit;
        self
    }

    /// Set the split-quality statistic.
    #[must_use]
    pub const fn stat_type(mut self, stat_type: StatType) -> Self {
        self.inner.stat_type = stat_type;
        self
    }

    /// Set class weights.
    #[must_use]
    pub fn class_weights(mut self, weights: impl Into<String>) -> Self {
        self.inner.class_weights = Some(weights.into());
        self
    }

    /// Set the service-side seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.inner.seed = Some(seed);
        self
    }

    /// Set features sampled per split.
    #[must_use]
    pub const fn features(mut self, features: u32) -> Self {
        self.inner.features = Some(features);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if any field is out of range.
    pub fn build(self) -> Result<HyperparameterConfig> {
        self.inner.verify()?;
        Ok(self.inner)
    }
}
