//! Trial Record - outcome of one decile trial

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trial Record holds the measured accuracies of one completed trial and
/// their deltas from the baselines.
///
/// Records are only created once every check of the trial has passed, and
/// are never modified after being appended to a [`TrialLog`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialRecord {
    trial: usize,
    rows_to_use: u64,
    pct_of_rows: f64,
    model_key: String,
    train_accuracy: f64,
    train_delta: f64,
    score_accuracy: f64,
    score_delta: f64,
    classification_error: f64,
    #[serde(default)]
    class_error_pct: Vec<f64>,
    total_scored: u64,
    train_elapsed: Duration,
    score_elapsed: Duration,
    completed_at: DateTime<Utc>,
}

impl TrialRecord {
    /// Create a builder with the fields known before training starts.
    #[must_use]
    pub fn builder(
        trial: usize,
        rows_to_use: u64,
        pct_of_rows: f64,
        model_key: impl Into<String>,
    ) -> TrialRecordBuilder {
        TrialRecordBuilder::new(trial, rows_to_use, pct_of_rows, model_key)
    }

    /// Trial index (1-based).
    #[must_use]
    pub const fn trial(&self) -> usize {
        self.trial
    }

    /// Rows trained on.
    #[must_use]
    pub const fn rows_to_use(&self) -> u64 {
        self.rows_to_use
    }

    /// Rows trained on, as a percentage of the full dataset.
    #[must_use]
    pub const fn pct_of_rows(&self) -> f64 {
        self.pct_of_rows
    }

    /// Key of the model trained in this trial.
    #[must_use]
    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    /// Out-of-bag percent-correct.
    #[must_use]
    pub const fn train_accuracy(&self) -> f64 {
        self.train_accuracy
    }

    /// `|train_accuracy - expected|`.
    #[must_use]
    pub const fn train_delta(&self) -> f64 {
        self.train_delta
    }

    /// Held-out percent-correct.
    #[must_use]
    pub const fn score_accuracy(&self) -> f64 {
        self.score_accuracy
    }

    /// `|score_accuracy - expected|`.
    #[must_use]
    pub const fn score_delta(&self) -> f64 {
        self.score_delta
    }

    /// Held-out classification error.
    #[must_use]
    pub const fn classification_error(&self) -> f64 {
        self.classification_error
    }

    /// Held-out error per actual class, in percent. Empty when the service
    /// returned no confusion counts.
    #[must_use]
    pub fn class_error_pct(&self) -> &[f64] {
        &self.class_error_pct
    }

    /// Records scored.
    #[must_use]
    pub const fn total_scored(&self) -> u64 {
        self.total_scored
    }

    /// Wall-clock time of the train call.
    #[must_use]
    pub const fn train_elapsed(&self) -> Duration {
        self.train_elapsed
    }

    /// Wall-clock time of the score call (including retries).
    #[must_use]
    pub const fn score_elapsed(&self) -> Duration {
        self.score_elapsed
    }

    /// When the trial passed its last check.
    #[must_use]
    pub const fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

/// Builder for `TrialRecord`.
#[derive(Debug)]
pub struct TrialRecordBuilder {
    record: TrialRecord,
    completed_at: Option<DateTime<Utc>>,
}

impl TrialRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        trial: usize,
        rows_to_use: u64,
        pct_of_rows: f64,
        model_key: impl Into<String>,
    ) -> Self {
        Self {
            record: TrialRecord {
                trial,
                rows_to_use,
                pct_of_rows,
                model_key: model_key.into(),
                train_accuracy: 0.0,
                train_delta: 0.0,
                score_accuracy: 0.0,
                score_delta: 0.0,
                classification_error: 0.0,
                class_error_pct: Vec::new(),
                total_scored: 0,
                train_elapsed: Duration::ZERO,
                score_elapsed: Duration::ZERO,
                completed_at: DateTime::<Utc>::MIN_UTC,
            },
            completed_at: None,
        }
    }

    /// Set the out-of-bag accuracy and its delta.
    #[must_use]
    pub const fn train(mut self, accuracy: f64, delta: f64, elapsed: Duration) -> Self {
        self.record.train_accuracy = accuracy;
        self.record.train_delta = delta;
        self.record.train_elapsed = elapsed;
        self
    }

    /// Set the held-out accuracy and its delta.
    #[must_use]
    pub const fn score(mut self, accuracy: f64, delta: f64, elapsed: Duration) -> Self {
        self.record.score_accuracy = accuracy;
        self.record.score_delta = delta;
        self.record.score_elapsed = elapsed;
        self
    }

    /// Set the held-out classification error and scored count.
    #[must_use]
    pub const fn scoring(mut self, classification_error: f64, total_scored: u64) -> Self {
        self.record.classification_error = classification_error;
        self.record.total_scored = total_scored;
        self
    }

    /// Set the held-out error of each actual class.
    #[must_use]
    pub fn class_errors(mut self, class_error_pct: Vec<f64>) -> Self {
        self.record.class_error_pct = class_error_pct;
        self
    }

    /// Set a custom completion timestamp.
    #[must_use]
    pub const fn completed_at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = Some(completed_at);
        self
    }

    /// Build the `TrialRecord`, stamping completion now unless overridden.
    #[must_use]
    pub fn build(self) -> TrialRecord {
        TrialRecord {
            completed_at: self.completed_at.unwrap_or_else(Utc::now),
            ..self.record
        }
    }
}

/// Append-only log of completed trials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrialLog {
    records: Vec<TrialRecord>,
}

impl TrialLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed trial.
    pub fn append(&mut self, record: TrialRecord) {
        self.records.push(record);
    }

    /// Completed trials, in the order they ran.
    #[must_use]
    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    /// Number of completed trials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no trial has completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record for a trial index, if it completed.
    #[must_use]
    pub fn get(&self, trial: usize) -> Option<&TrialRecord> {
        self.records.iter().find(|r| r.trial() == trial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_record_builder() {
        let record = TrialRecord::builder(5, 290_505, 50.0, "model_5")
            .train(92.03, 0.0, Duration::from_secs(40))
            .score(94.50, 0.02, Duration::from_secs(12))
            .scoring(0.055, 58_101)
            .class_errors(vec![4.0, 7.5])
            .build();
        assert_eq!(record.trial(), 5);
        assert_eq!(record.rows_to_use(), 290_505);
        assert_eq!(record.model_key(), "model_5");
        assert!((record.score_delta() - 0.02).abs() < f64::EPSILON);
        assert_eq!(record.total_scored(), 58_101);
        assert_eq!(record.class_error_pct(), &[4.0, 7.5]);
        assert_eq!(record.train_elapsed(), Duration::from_secs(40));
    }

    #[test]
    fn test_trial_log_append_order() {
        let mut log = TrialLog::new();
        assert!(log.is_empty());
        log.append(TrialRecord::builder(1, 10, 10.0, "model_1").build());
        log.append(TrialRecord::builder(2, 20, 20.0, "model_2").build());

        assert_eq!(log.len(), 2);
        assert_eq!(log.records()[0].trial(), 1);
        assert_eq!(log.get(2).map(TrialRecord::rows_to_use), Some(20));
        assert!(log.get(3).is_none());
    }

    #[test]
    fn test_trial_record_serialization() {
        let record = TrialRecord::builder(3, 174_303, 30.0, "model_3")
            .train(90.2, 0.04, Duration::from_millis(1500))
            .class_errors(vec![9.5, 10.25, 0.0])
            .build();
        let json = serde_json::to_string(&record).expect("serialization failed");
        let back: TrialRecord = serde_json::from_str(&json).expect("deserialization failed");
        assert_eq!(record, back);
    }
}
