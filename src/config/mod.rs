//! Harness configuration
//!
//! A run is described by one JSON document:
//!
//! ```json
//! {
//!   "dataset": { "bucket": "home-0xdiag-datasets", "path": "standard/covtype.data", "header": false },
//!   "cluster": { "base_url": "http://127.0.0.1:54321", "node_count": 1, "java_heap_gb": 10 },
//!   "hyperparameters": { "ntree": 10 },
//!   "trials": 9
//! }
//! ```
//!
//! Every section and field other than `dataset.bucket` and `dataset.path`
//! has a default matching the covtype baseline run. Unknown fields are
//! rejected.

mod hyperparams;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use hyperparams::{HyperparameterConfig, HyperparameterConfigBuilder, StatType, UNBOUNDED_DEPTH};

use crate::validate::{ExpectationCurve, Tolerances};
use crate::{Error, Result};

/// Seed used for both random filters.
pub const DEFAULT_SEED: u64 = 12345;

/// Number of decile trials in a full run.
pub const MAX_TRIALS: usize = 9;

/// Location of the labeled input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    /// Storage location (directory or bucket) of the input file
    pub bucket: String,
    /// File path relative to `bucket`
    pub path: String,
    /// Whether row 0 holds column names
    #[serde(default)]
    pub header: bool,
    /// Key for the parsed frame; defaults to `<file name>.hex`
    #[serde(default)]
    pub hex_key: Option<String>,
}

impl DatasetConfig {
    /// Key the parsed dataset is stored under.
    #[must_use]
    pub fn hex_key(&self) -> String {
        self.hex_key.clone().unwrap_or_else(|| {
            let file_name = Path::new(&self.path)
                .file_name()
                .map_or_else(|| self.path.clone(), |n| n.to_string_lossy().into_owned());
            format!("{file_name}.hex")
        })
    }

    /// Full path of the input file.
    #[must_use]
    pub fn full_path(&self) -> PathBuf {
        Path::new(&self.bucket).join(&self.path)
    }
}

/// Service cluster the harness connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterConfig {
    /// REST endpoint of the first node
    pub base_url: String,
    /// Expected cluster size
    pub node_count: u32,
    /// Per-node memory budget
    pub java_heap_gb: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:54321".to_string(),
            node_count: 1,
            java_heap_gb: 10,
        }
    }
}

/// Retry policy applied at the score boundary only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Fixed delay between attempts, in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }

    /// Delay between attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Time bounds for the short service calls. Train, score and predict use
/// `30 + ntree * 20` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timeouts {
    /// Import/parse bound, seconds
    pub import_secs: u64,
    /// Filter, slice, inspect and remove bound, seconds
    pub short_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            import_secs: 100,
            short_secs: 10,
        }
    }
}

impl Timeouts {
    /// Import/parse bound.
    #[must_use]
    pub const fn import(&self) -> Duration {
        Duration::from_secs(self.import_secs)
    }

    /// Bound for the short data-plane calls.
    #[must_use]
    pub const fn short(&self) -> Duration {
        Duration::from_secs(self.short_secs)
    }
}

/// Complete description of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Input dataset
    pub dataset: DatasetConfig,
    /// Service cluster
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Training options
    #[serde(default)]
    pub hyperparameters: HyperparameterConfig,
    /// Baseline accuracy curves
    #[serde(default)]
    pub expectations: ExpectationCurve,
    /// Tolerance bands
    #[serde(default)]
    pub tolerances: Tolerances,
    /// Score retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Short-call time bounds
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Seed for both random filters
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of decile trials (1..=9)
    #[serde(default = "default_trials")]
    pub trials: usize,
    /// Fail setup unless the service guarantees a disjoint test/train split
    #[serde(default)]
    pub require_disjoint_partition: bool,
    /// Where to write the JSON run report
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

const fn default_seed() -> u64 {
    DEFAULT_SEED
}

const fn default_trials() -> usize {
    MAX_TRIALS
}

impl HarnessConfig {
    /// Baseline configuration for a dataset location.
    #[must_use]
    pub fn new(bucket: impl Into<String>, path: impl Into<String>, header: bool) -> Self {
        Self {
            dataset: DatasetConfig {
                bucket: bucket.into(),
                path: path.into(),
                header,
                hex_key: None,
            },
            cluster: ClusterConfig::default(),
            hyperparameters: HyperparameterConfig::default(),
            expectations: ExpectationCurve::default(),
            tolerances: Tolerances::default(),
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            seed: DEFAULT_SEED,
            trials: MAX_TRIALS,
            require_disjoint_partition: false,
            report_path: None,
        }
    }

    /// Load configuration from a JSON file and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read, parsed or
    /// fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_json_str(&content)
    }

    /// Parse configuration from a JSON string and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on parse or validation failure.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-section constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.dataset.path.is_empty() {
            return Err(Error::Configuration("dataset.path is empty".to_string()));
        }
        if !(1..=MAX_TRIALS).contains(&self.trials) {
            return Err(Error::Configuration(format!(
                "trials must be within 1..={MAX_TRIALS}, got {}",
                self.trials
            )));
        }
        if self.cluster.node_count == 0 {
            return Err(Error::Configuration(
                "cluster.node_count must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.timeouts.import_secs == 0 {
            return Err(Error::Configuration(
                "timeouts.import_secs must be at least 1".to_string(),
            ));
        }
        if self.timeouts.short_secs == 0 {
            return Err(Error::Configuration(
                "timeouts.short_secs must be at least 1".to_string(),
            ));
        }
        self.hyperparameters.verify()?;
        self.expectations.verify()?;
        self.tolerances.verify()?;
        Ok(())
    }

    /// Bound for train, score and predict calls.
    #[must_use]
    pub const fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.hyperparameters.timeout_secs())
    }
}
