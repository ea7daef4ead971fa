//! Run report
//!
//! Built from the trial log after the run, pass or fail. The report only
//! observes: every pass/fail decision was already made by the validator.
//!
//! Curves have one entry per decile with index 0 unused. Trials that never
//! ran (because an earlier one failed, or `trials < 9`) are reported as
//! zeros, and `trials_completed` says how many entries are real.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trial::TrialLog;
use crate::validate::{ExpectationCurve, CURVE_LEN};
use crate::window::{RowWindowTable, WINDOW_COUNT};
use crate::{Error, Result};

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every trial passed
    Passed,
    /// A trial failed a check or the service failed
    Failed,
}

/// Observed curves, their deltas from the baselines, and how the run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    status: RunStatus,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    num_rows: Option<u64>,
    windows: Option<[u64; WINDOW_COUNT]>,
    trials_completed: usize,
    expected_train: [f64; CURVE_LEN],
    expected_score: [f64; CURVE_LEN],
    actual_train: [f64; CURVE_LEN],
    actual_score: [f64; CURVE_LEN],
    train_delta: [f64; CURVE_LEN],
    score_delta: [f64; CURVE_LEN],
    failure: Option<String>,
    failed_trial: Option<usize>,
}

impl RunReport {
    /// Build a report for a run that passed.
    ///
    /// Deltas are `|actual - expected|` per trial.
    #[must_use]
    pub fn from_log(curve: &ExpectationCurve, log: &TrialLog) -> Self {
        let now = Utc::now();
        let mut report = Self {
            status: RunStatus::Passed,
            started_at: now,
            finished_at: now,
            num_rows: None,
            windows: None,
            trials_completed: log.len(),
            expected_train: *curve.train_curve(),
            expected_score: *curve.score_curve(),
            actual_train: [0.0; CURVE_LEN],
            actual_score: [0.0; CURVE_LEN],
            train_delta: [0.0; CURVE_LEN],
            score_delta: [0.0; CURVE_LEN],
            failure: None,
            failed_trial: None,
        };
        for record in log.records() {
            let i = record.trial() % CURVE_LEN;
            report.actual_train[i] = record.train_accuracy();
            report.actual_score[i] = record.score_accuracy();
            report.train_delta[i] = (record.train_accuracy() - curve.train(i)).abs();
            report.score_delta[i] = (record.score_accuracy() - curve.score(i)).abs();
        }
        report
    }

    /// Mark the run as failed with `error`.
    #[must_use]
    pub fn failed(mut self, error: &Error) -> Self {
        self.status = RunStatus::Failed;
        self.failure = Some(error.to_string());
        self.failed_trial = error.failed_trial();
        self
    }

    /// Attach the window table of the run.
    #[must_use]
    pub const fn with_table(mut self, table: &RowWindowTable) -> Self {
        self.num_rows = Some(table.num_rows());
        self.windows = Some(*table.as_array());
        self
    }

    /// Set when the run started and finished.
    #[must_use]
    pub const fn with_times(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.finished_at = finished_at;
        self
    }

    /// Outcome.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Trials that passed.
    #[must_use]
    pub const fn trials_completed(&self) -> usize {
        self.trials_completed
    }

    /// Observed out-of-bag accuracy per trial.
    #[must_use]
    pub const fn actual_train(&self) -> &[f64; CURVE_LEN] {
        &self.actual_train
    }

    /// Observed held-out accuracy per trial.
    #[must_use]
    pub const fn actual_score(&self) -> &[f64; CURVE_LEN] {
        &self.actual_score
    }

    /// `|actual - expected|` of the train curve.
    #[must_use]
    pub const fn train_delta(&self) -> &[f64; CURVE_LEN] {
        &self.train_delta
    }

    /// `|actual - expected|` of the score curve.
    #[must_use]
    pub const fn score_delta(&self) -> &[f64; CURVE_LEN] {
        &self.score_delta
    }

    /// Failure message, if the run failed.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Trial that failed validation, if any.
    #[must_use]
    pub const fn failed_trial(&self) -> Option<usize> {
        self.failed_trial
    }

    /// Rows in the dataset, when known.
    #[must_use]
    pub const fn num_rows(&self) -> Option<u64> {
        self.num_rows
    }

    /// Log both curves and their deltas at `info`.
    pub fn log_summary(&self) {
        tracing::info!("expected train: {}", format_list(&self.expected_train));
        tracing::info!("actual train:   {}", format_list(&self.actual_train));
        tracing::info!("train delta:    {}", format_list(&self.train_delta));
        tracing::info!("expected score: {}", format_list(&self.expected_score));
        tracing::info!("actual score:   {}", format_list(&self.actual_score));
        tracing::info!("score delta:    {}", format_list(&self.score_delta));
        match &self.failure {
            None => tracing::info!(trials = self.trials_completed, "run passed"),
            Some(failure) => {
                tracing::error!(trials = self.trials_completed, "run failed: {failure}");
            }
        }
    }

    /// Write the report as pretty-printed JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns I/O or serialization errors.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("wrote report to {}", path.display());
        Ok(())
    }
}

/// Render values with two decimals: `[0.00, 85.16, ...]`.
#[must_use]
pub fn format_list(values: &[f64]) -> String {
    let items: Vec<String> = values.iter().map(|v| format!("{v:.2}")).collect();
    format!("[{}]", items.join(", "))
}
