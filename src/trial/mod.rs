//! Decile trials
//!
//! Trial `i` trains on the first `T[i]` rows of the training pool, checks
//! the out-of-bag accuracy, scores the held-out test set and checks that
//! too. The first failed check ends the run: [`TrialController::run`]
//! short-circuits with `?`, so later trials never start.
//!
//! ```text
//! slice r{i} ─> train model_{i} ─> check train ─> score rTest ─> check error
//!                                                      │
//!            release r{i}, model_{i}, predictions <─ check score <─ predict
//! ```

mod record;

pub use record::{TrialLog, TrialRecord, TrialRecordBuilder};

use std::time::{Duration, Instant};

use tracing::Instrument;

use crate::config::{HyperparameterConfig, MAX_TRIALS};
use crate::partition::Partition;
use crate::service::{ScoreRequest, TrainRequest, TrainingService};
use crate::session::Session;
use crate::validate::{accuracy_pct, Validator};
use crate::window::RowWindowTable;
use crate::{Error, Result};

/// Key of the training slice for a trial.
#[must_use]
pub fn slice_key(trial: usize) -> String {
    format!("r{trial}")
}

/// Key of the model trained in a trial.
#[must_use]
pub fn model_key(trial: usize) -> String {
    format!("model_{trial}")
}

/// Runs the decile trials in order.
#[derive(Debug, Clone)]
pub struct TrialController {
    validator: Validator,
    hyperparameters: HyperparameterConfig,
    trials: usize,
}

impl TrialController {
    /// Controller running trials `1..=trials`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `trials` is outside `1..=9`.
    pub fn new(
        validator: Validator,
        hyperparameters: HyperparameterConfig,
        trials: usize,
    ) -> Result<Self> {
        if !(1..=MAX_TRIALS).contains(&trials) {
            return Err(Error::Configuration(format!(
                "trials must be within 1..={MAX_TRIALS}, got {trials}"
            )));
        }
        Ok(Self {
            validator,
            hyperparameters,
            trials,
        })
    }

    /// Number of trials this controller runs.
    #[must_use]
    pub const fn trials(&self) -> usize {
        self.trials
    }

    /// Run every trial, appending each passed trial to `log`.
    ///
    /// Trials that passed before a failure stay in `log`.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure, timeout or service error.
    pub async fn run<S: TrainingService>(
        &self,
        session: &Session<S>,
        table: &RowWindowTable,
        partition: &Partition,
        log: &mut TrialLog,
    ) -> Result<()> {
        for trial in 1..=self.trials {
            let span = tracing::info_span!("trial", trial);
            let record = self
                .run_trial(session, table, partition, trial)
                .instrument(span)
                .await?;
            log.append(record);
        }
        tracing::info!(trials = log.len(), "all trials passed");
        Ok(())
    }

    /// Run a single trial.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure, timeout or service error.
    pub async fn run_trial<S: TrainingService>(
        &self,
        session: &Session<S>,
        table: &RowWindowTable,
        partition: &Partition,
        trial: usize,
    ) -> Result<TrialRecord> {
        let rows_to_use = table.rows_for_trial(trial);
        let pct_of_rows = table.pct_of_rows(trial);
        let model_key = model_key(trial);
        tracing::info!(rows_to_use, "training on {pct_of_rows:.2}% of all rows");

        let slice = session
            .slice(partition.train_pool(), 1, rows_to_use, &slice_key(trial))
            .await?;

        let started = Instant::now();
        let model = session
            .train(&TrainRequest {
                data: slice.clone(),
                hyperparameters: self.hyperparameters.clone(),
                model_key: model_key.clone(),
                out_of_bag: true,
            })
            .await?;
        let train_elapsed = started.elapsed();
        tracing::info!(
            elapsed_ms = duration_ms(train_elapsed),
            "trained {} in {:.1}% of its timeout",
            model.model_key,
            pct_of(train_elapsed, session.model_timeout())
        );

        let train_accuracy = accuracy_pct(model.confusion_matrix.classification_error);
        let train_delta = self.validator.check_train_accuracy(trial, train_accuracy)?;

        let started = Instant::now();
        let scoring = session
            .score(&ScoreRequest {
                data: partition.test().clone(),
                model_key: model_key.clone(),
                ntree: model.ntree,
                iterative_cm: true,
                out_of_bag: false,
            })
            .await?;
        let score_elapsed = started.elapsed();
        self.validator.check_scoring_result(&model, &scoring)?;

        let classification_error = scoring.confusion_matrix.classification_error;
        self.validator
            .check_classification_error(trial, classification_error)?;

        let predictions = session
            .generate_predictions(&model_key, partition.test())
            .await?;

        let score_accuracy = accuracy_pct(classification_error);
        let score_delta = self.validator.check_score_accuracy(trial, score_accuracy)?;

        let class_error_pct = scoring.confusion_matrix.class_error_pct();
        tracing::info!(
            scored = scoring.total_scored,
            ?class_error_pct,
            "trial passed: train {train_accuracy:.2} (delta {train_delta:.2}), \
             score {score_accuracy:.2} (delta {score_delta:.2})"
        );

        let record = TrialRecord::builder(trial, rows_to_use, pct_of_rows, model_key.clone())
            .train(train_accuracy, train_delta, train_elapsed)
            .score(score_accuracy, score_delta, score_elapsed)
            .scoring(classification_error, scoring.total_scored)
            .class_errors(class_error_pct)
            .build();

        session.release(&slice.key).await;
        session.release(&model_key).await;
        session.release(&predictions.key).await;

        Ok(record)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn pct_of(elapsed: Duration, bound: Duration) -> f64 {
    if bound.is_zero() {
        return 0.0;
    }
    100.0 * elapsed.as_secs_f64() / bound.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{ExpectationCurve, Tolerances};

    #[test]
    fn test_keys() {
        assert_eq!(slice_key(3), "r3");
        assert_eq!(model_key(9), "model_9");
    }

    #[test]
    fn test_trial_count_bounds() {
        let validator = Validator::new(ExpectationCurve::default(), Tolerances::default());
        let params = HyperparameterConfig::default();
        assert!(TrialController::new(validator.clone(), params.clone(), 0).is_err());
        assert!(TrialController::new(validator.clone(), params.clone(), 10).is_err());
        assert_eq!(
            TrialController::new(validator, params, 9).unwrap().trials(),
            9
        );
    }

    #[test]
    fn test_pct_of_timeout() {
        let pct = pct_of(Duration::from_secs(23), Duration::from_secs(230));
        assert!((pct - 10.0).abs() < 1e-9);
        assert!(pct_of(Duration::from_secs(1), Duration::ZERO).abs() < f64::EPSILON);
    }
}
