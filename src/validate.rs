//! Tolerance checks
//!
//! Each check returns `Ok(delta)` when the observed value is inside its band
//! and [`Error::Validation`] otherwise. The trial controller propagates the
//! first failure with `?`, which ends the run.

use serde::{Deserialize, Serialize};

use crate::service::{Model, ScoringResult};
use crate::{Error, Result};

/// Entries per curve; index 0 is unused.
pub const CURVE_LEN: usize = 10;

/// Metric names used in validation errors and logs.
pub mod metric {
    /// Out-of-bag accuracy after training
    pub const TRAIN_ACCURACY: &str = "train accuracy";
    /// Accuracy scoring the held-out set
    pub const SCORE_ACCURACY: &str = "score accuracy";
    /// Classification error scoring the held-out set
    pub const CLASSIFICATION_ERROR: &str = "classification error";
}

/// Baseline percent-correct for each decile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectationCurve {
    train: [f64; CURVE_LEN],
    score: [f64; CURVE_LEN],
}

impl Default for ExpectationCurve {
    /// covtype baselines, 10 trees, entropy splits.
    fn default() -> Self {
        Self {
            train: [
                0.0, 85.16, 88.45, 90.24, 91.27, 92.03, 92.64, 93.11, 93.48, 93.79,
            ],
            score: [
                0.0, 88.81, 91.72, 93.06, 94.02, 94.52, 95.09, 95.41, 95.77, 95.78,
            ],
        }
    }
}

impl ExpectationCurve {
    /// Create a curve pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a value is not a percentage.
    pub fn new(train: [f64; CURVE_LEN], score: [f64; CURVE_LEN]) -> Result<Self> {
        let curve = Self { train, score };
        curve.verify()?;
        Ok(curve)
    }

    /// Check every entry lies in `0..=100`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the bad entry.
    pub fn verify(&self) -> Result<()> {
        for (name, curve) in [("train", &self.train), ("score", &self.score)] {
            if let Some((i, v)) = curve
                .iter()
                .enumerate()
                .find(|(_, v)| !(0.0..=100.0).contains(*v))
            {
                return Err(Error::Configuration(format!(
                    "expectations.{name}[{i}] = {v} is not a percentage"
                )));
            }
        }
        Ok(())
    }

    /// Expected out-of-bag percent-correct after training on decile `trial`.
    #[must_use]
    pub const fn train(&self, trial: usize) -> f64 {
        self.train[trial % CURVE_LEN]
    }

    /// Expected held-out percent-correct after training on decile `trial`.
    #[must_use]
    pub const fn score(&self, trial: usize) -> f64 {
        self.score[trial % CURVE_LEN]
    }

    /// Whole train curve.
    #[must_use]
    pub const fn train_curve(&self) -> &[f64; CURVE_LEN] {
        &self.train
    }

    /// Whole score curve.
    #[must_use]
    pub const fn score_curve(&self) -> &[f64; CURVE_LEN] {
        &self.score
    }
}

/// Allowed absolute deviations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Tolerances {
    /// Train accuracy band, percentage points
    pub train_accuracy: f64,
    /// Score accuracy band, percentage points
    pub score_accuracy: f64,
    /// Expected classification error
    pub classification_error_center: f64,
    /// Classification error band (coarse sanity bound)
    pub classification_error: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            train_accuracy: 0.2,
            score_accuracy: 0.2,
            classification_error_center: 0.03,
            classification_error: 0.5,
        }
    }
}

impl Tolerances {
    /// Bands must be finite and non-negative.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the bad band.
    pub fn verify(&self) -> Result<()> {
        for (name, value) in [
            ("train_accuracy", self.train_accuracy),
            ("score_accuracy", self.score_accuracy),
            ("classification_error", self.classification_error),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Configuration(format!(
                    "tolerances.{name} = {value} must be a non-negative number"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.classification_error_center) {
            return Err(Error::Configuration(
                "tolerances.classification_error_center must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Percent of records classified correctly.
#[must_use]
pub fn accuracy_pct(classification_error: f64) -> f64 {
    100.0 * (1.0 - classification_error)
}

/// Check `|actual - expected| <= tolerance`, returning the delta.
///
/// A NaN actual value always fails.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the value is outside the band.
pub fn check_within(
    trial: usize,
    metric: &str,
    expected: f64,
    actual: f64,
    tolerance: f64,
) -> Result<f64> {
    let delta = (actual - expected).abs();
    if delta <= tolerance {
        Ok(delta)
    } else {
        Err(Error::Validation {
            trial,
            metric: metric.to_string(),
            expected,
            actual,
            delta,
            tolerance,
        })
    }
}

/// Per-trial gate built from the baselines and bands.
#[derive(Debug, Clone, PartialEq)]
pub struct Validator {
    curve: ExpectationCurve,
    tolerances: Tolerances,
}

impl Validator {
    /// Create a validator.
    #[must_use]
    pub const fn new(curve: ExpectationCurve, tolerances: Tolerances) -> Self {
        Self { curve, tolerances }
    }

    /// Baselines in use.
    #[must_use]
    pub const fn curve(&self) -> &ExpectationCurve {
        &self.curve
    }

    /// Out-of-bag accuracy against the train curve.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] outside the band.
    pub fn check_train_accuracy(&self, trial: usize, actual: f64) -> Result<f64> {
        check_within(
            trial,
            metric::TRAIN_ACCURACY,
            self.curve.train(trial),
            actual,
            self.tolerances.train_accuracy,
        )
    }

    /// Held-out accuracy against the score curve.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] outside the band.
    pub fn check_score_accuracy(&self, trial: usize, actual: f64) -> Result<f64> {
        check_within(
            trial,
            metric::SCORE_ACCURACY,
            self.curve.score(trial),
            actual,
            self.tolerances.score_accuracy,
        )
    }

    /// Coarse sanity bound on the held-out classification error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] outside the band.
    pub fn check_classification_error(&self, trial: usize, actual: f64) -> Result<f64> {
        check_within(
            trial,
            metric::CLASSIFICATION_ERROR,
            self.tolerances.classification_error_center,
            actual,
            self.tolerances.classification_error,
        )
    }

    /// Structural checks on a scoring result: tree count matches the model,
    /// the error is a rate, and the confusion matrix (when present) is square
    /// and sums to the scored total.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Service`] describing the malformed field.
    pub fn check_scoring_result(&self, model: &Model, scoring: &ScoringResult) -> Result<()> {
        let malformed = |message: String| Error::service("score", message);

        if scoring.ntree != model.ntree {
            return Err(malformed(format!(
                "scored with {} trees, model {} has {}",
                scoring.ntree, model.model_key, model.ntree
            )));
        }
        let error = scoring.confusion_matrix.classification_error;
        if !(0.0..=1.0).contains(&error) {
            return Err(malformed(format!("classification error {error} outside [0, 1]")));
        }
        if let Some(bad) = scoring
            .tree_errors
            .iter()
            .find(|e| !(0.0..=1.0).contains(*e))
        {
            return Err(malformed(format!("per-tree error {bad} outside [0, 1]")));
        }
        if !scoring.tree_errors.is_empty() && scoring.tree_errors.len() != scoring.ntree as usize {
            return Err(malformed(format!(
                "{} per-tree errors for {} trees",
                scoring.tree_errors.len(),
                scoring.ntree
            )));
        }
        if let Some(rows) = &scoring.confusion_matrix.counts {
            if rows.iter().any(|row| row.len() != rows.len()) {
                return Err(malformed("confusion matrix is not square".to_string()));
            }
            let total = scoring.confusion_matrix.total().unwrap_or(0);
            if total != scoring.total_scored {
                return Err(malformed(format!(
                    "confusion matrix sums to {total}, {} records scored",
                    scoring.total_scored
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ConfusionMatrix;

    fn model(ntree: u32) -> Model {
        Model {
            model_key: "model_1".to_string(),
            data_key: "r1".to_string(),
            ntree,
            confusion_matrix: ConfusionMatrix::from_error(0.1),
        }
    }

    fn scoring(ntree: u32, cm: ConfusionMatrix, total: u64) -> ScoringResult {
        ScoringResult {
            model_key: "model_1".to_string(),
            data_key: "rTest".to_string(),
            ntree,
            confusion_matrix: cm,
            tree_errors: Vec::new(),
            total_scored: total,
        }
    }

    #[test]
    fn test_check_within_band() {
        let delta = check_within(5, metric::TRAIN_ACCURACY, 92.03, 92.10, 0.2).unwrap();
        assert!((delta - 0.07).abs() < 1e-9);
    }

    #[test]
    fn test_check_within_failure_carries_context() {
        let err = check_within(3, metric::SCORE_ACCURACY, 93.06, 92.5, 0.2).unwrap_err();
        assert_eq!(err.failed_trial(), Some(3));
        let message = err.to_string();
        assert!(message.contains("trial 3"));
        assert!(message.contains("score accuracy"));
        assert!(message.contains("93.06"));
        assert!(message.contains("92.50"));
        assert!(message.contains("0.56"));
    }

    #[test]
    fn test_nan_fails() {
        assert!(check_within(1, "x", 1.0, f64::NAN, 0.2).is_err());
    }

    #[test]
    fn test_covtype_trial_five() {
        let validator = Validator::new(ExpectationCurve::default(), Tolerances::default());
        assert!(validator.check_train_accuracy(5, 92.03).is_ok());
        assert!(validator.check_train_accuracy(5, 92.24).is_err());
        assert!(validator.check_score_accuracy(5, 94.40).is_ok());
        assert!(validator.check_classification_error(5, 0.0548).is_ok());
        assert!(validator.check_classification_error(5, 0.6).is_err());
    }

    #[test]
    fn test_accuracy_pct() {
        assert!((accuracy_pct(0.0797) - 92.03).abs() < 1e-9);
    }

    #[test]
    fn test_curve_rejects_non_percentage() {
        let mut train = *ExpectationCurve::default().train_curve();
        train[4] = 101.0;
        let err = ExpectationCurve::new(train, *ExpectationCurve::default().score_curve());
        assert!(err.unwrap_err().to_string().contains("train[4]"));
    }

    #[test]
    fn test_curve_requires_ten_entries() {
        let json = serde_json::json!({ "train": [0.0, 1.0], "score": [0.0, 1.0] });
        assert!(serde_json::from_value::<ExpectationCurve>(json).is_err());
    }

    #[test]
    fn test_scoring_structure() {
        let validator = Validator::new(ExpectationCurve::default(), Tolerances::default());
        let good = ConfusionMatrix {
            classification_error: 0.25,
            counts: Some(vec![vec![3, 1], vec![1, 3]]),
        };
        assert!(validator
            .check_scoring_result(&model(10), &scoring(10, good.clone(), 8))
            .is_ok());
        assert!(validator
            .check_scoring_result(&model(10), &scoring(9, good.clone(), 8))
            .is_err());
        assert!(validator
            .check_scoring_result(&model(10), &scoring(10, good, 9))
            .is_err());

        let ragged = ConfusionMatrix {
            classification_error: 0.25,
            counts: Some(vec![vec![3, 1, 0], vec![1, 3]]),
        };
        assert!(validator
            .check_scoring_result(&model(10), &scoring(10, ragged, 8))
            .is_err());
    }
}
