//! Trial controller tests against the in-process backend
//!
//! The backend's evaluator reproduces the covtype curves exactly at each
//! decile; individual steps are then skewed to force failures at a chosen
//! trial.

use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Int32Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use oobe_harness::config::{ClusterConfig, HyperparameterConfig, RetryPolicy, Timeouts};
use oobe_harness::partition::{Partition, Partitioner};
use oobe_harness::service::{CurveEvaluator, MemoryService};
use oobe_harness::session::Session;
use oobe_harness::trial::{TrialController, TrialLog};
use oobe_harness::validate::{metric, ExpectationCurve, Tolerances, Validator};
use oobe_harness::window::RowWindowTable;
use oobe_harness::Error;

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn frame(rows: usize) -> RecordBatch {
    let schema = Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("label", DataType::Int32, false),
    ]);
    RecordBatch::try_new(
        Arc::new(schema),
        vec![
            Arc::new(Int64Array::from_iter_values(0..rows as i64)),
            Arc::new(Int32Array::from_iter_values((0..rows).map(|i| (i % 7) as i32))),
        ],
    )
    .unwrap()
}

fn hyperparameters() -> HyperparameterConfig {
    HyperparameterConfig::builder()
        .response_column(1)
        .ignored_columns(Vec::new())
        .build()
        .unwrap()
}

fn controller(trials: usize) -> TrialController {
    TrialController::new(
        Validator::new(ExpectationCurve::default(), Tolerances::default()),
        hyperparameters(),
        trials,
    )
    .unwrap()
}

/// Train/score error rates that land exactly on the default curves.
fn errors(trial: usize) -> (f64, f64) {
    let curve = ExpectationCurve::default();
    (1.0 - curve.train(trial) / 100.0, 1.0 - curve.score(trial) / 100.0)
}

struct Fixture {
    session: Session<MemoryService>,
    table: RowWindowTable,
    partition: Partition,
}

async fn fixture(
    num_rows: usize,
    skew: impl FnOnce(CurveEvaluator, &RowWindowTable) -> CurveEvaluator,
    model_timeout: Duration,
) -> Fixture {
    let table = RowWindowTable::new(num_rows as u64).unwrap();
    let evaluator = skew(
        CurveEvaluator::from_expectations(&table, &ExpectationCurve::default()),
        &table,
    );
    let service = MemoryService::new(evaluator);
    let source = service.insert_frame("covtype.data.hex", frame(num_rows));

    let session = Session::connect(
        service,
        &ClusterConfig::default(),
        Timeouts::default(),
        model_timeout,
        RetryPolicy {
            max_attempts: 3,
            delay_ms: 1,
        },
    )
    .await
    .unwrap();
    let partition = Partitioner::default()
        .partition(&session, &source, &table)
        .await
        .unwrap();

    Fixture {
        session,
        table,
        partition,
    }
}

async fn run(fixture: &Fixture, trials: usize) -> (TrialLog, oobe_harness::Result<()>) {
    let mut log = TrialLog::new();
    let result = controller(trials)
        .run(&fixture.session, &fixture.table, &fixture.partition, &mut log)
        .await;
    (log, result)
}

#[tokio::test]
async fn test_covtype_sized_run_passes_all_trials() {
    let fixture = fixture(581_012, |e, _| e, Duration::from_secs(230)).await;
    let (log, result) = run(&fixture, 9).await;
    result.unwrap();

    assert_eq!(log.len(), 9);
    let rows: Vec<u64> = log.records().iter().map(|r| r.rows_to_use()).collect();
    let expected: Vec<u64> = (1..=9).map(|i| i * 58_101).collect();
    assert_eq!(rows, expected);
    assert_eq!(log.get(9).unwrap().rows_to_use(), 522_909);

    let curve = ExpectationCurve::default();
    for record in log.records() {
        let i = record.trial();
        assert_eq!(record.model_key(), format!("model_{i}"));
        assert!((record.train_accuracy() - curve.train(i)).abs() < 1e-9);
        assert!((record.score_accuracy() - curve.score(i)).abs() < 1e-9);
        assert_eq!(record.total_scored(), 58_101);

        // Seven labels, each missed at about the overall held-out error.
        let class_errors = record.class_error_pct();
        assert_eq!(class_errors.len(), 7);
        let overall = 100.0 - record.score_accuracy();
        assert!(class_errors.iter().all(|e| (e - overall).abs() < 0.01));
    }

    let service = fixture.session.service();
    assert_eq!(service.train_calls(), 9);
    assert_eq!(service.score_calls(), 9);
    // Only the source and the two partition frames outlive the trials.
    assert_eq!(service.model_count(), 0);
    assert_eq!(service.frame_count(), 3);
}

#[tokio::test]
async fn test_trial_one_uses_first_decile() {
    let fixture = fixture(1_000, |e, _| e, Duration::from_secs(5)).await;
    let (log, result) = run(&fixture, 1).await;
    result.unwrap();

    assert_eq!(log.len(), 1);
    let record = log.get(1).unwrap();
    assert_eq!(record.rows_to_use(), 100);
    assert!((record.pct_of_rows() - 10.0).abs() < 1e-9);
    assert_eq!(fixture.session.service().train_calls(), 1);
}

#[tokio::test]
async fn test_train_accuracy_failure_stops_run() {
    let fixture = fixture(
        1_000,
        |e, table| {
            let (train, score) = errors(4);
            // One point of accuracy off the curve at the fourth decile.
            e.with_step(table.get(4), train + 0.01, score)
        },
        Duration::from_secs(5),
    )
    .await;
    let (log, result) = run(&fixture, 9).await;

    let err = result.unwrap_err();
    match &err {
        Error::Validation {
            trial,
            metric: name,
            expected,
            delta,
            ..
        } => {
            assert_eq!(*trial, 4);
            assert_eq!(name, metric::TRAIN_ACCURACY);
            assert!((expected - 91.27).abs() < 1e-9);
            assert!((delta - 1.0).abs() < 1e-6);
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert_eq!(log.len(), 3);
    assert_eq!(fixture.session.service().train_calls(), 4);
    // Trial 4 never reached scoring.
    assert_eq!(fixture.session.service().score_calls(), 3);
}

#[tokio::test]
async fn test_score_accuracy_failure_stops_run() {
    let fixture = fixture(
        1_000,
        |e, table| {
            let (train, score) = errors(2);
            e.with_step(table.get(2), train, score + 0.005)
        },
        Duration::from_secs(5),
    )
    .await;
    let (log, result) = run(&fixture, 9).await;

    let err = result.unwrap_err();
    assert_eq!(err.failed_trial(), Some(2));
    assert!(err.to_string().contains(metric::SCORE_ACCURACY));
    assert_eq!(log.len(), 1);
    assert_eq!(fixture.session.service().train_calls(), 2);
}

#[tokio::test]
async fn test_classification_error_sanity_bound() {
    let fixture = fixture(
        1_000,
        |e, table| {
            let (train, _) = errors(1);
            e.with_step(table.get(1), train, 0.6)
        },
        Duration::from_secs(5),
    )
    .await;
    let (log, result) = run(&fixture, 9).await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains(metric::CLASSIFICATION_ERROR));
    assert_eq!(err.failed_trial(), Some(1));
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_score_retried_when_unavailable() {
    let fixture = fixture(1_000, |e, _| e, Duration::from_secs(5)).await;
    fixture.session.service().fail_next_scores(2);
    let (log, result) = run(&fixture, 3).await;

    result.unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(fixture.session.service().score_calls(), 5);
}

#[tokio::test]
async fn test_score_retry_exhausted() {
    let fixture = fixture(1_000, |e, _| e, Duration::from_secs(5)).await;
    fixture.session.service().fail_next_scores(3);
    let (log, result) = run(&fixture, 9).await;

    assert!(matches!(
        result.unwrap_err(),
        Error::ServiceUnavailable { attempts: 3, .. }
    ));
    assert!(log.is_empty());
    assert_eq!(fixture.session.service().train_calls(), 1);
}

#[tokio::test]
async fn test_train_timeout_is_fatal() {
    let table = RowWindowTable::new(1_000).unwrap();
    let service = MemoryService::new(CurveEvaluator::from_expectations(
        &table,
        &ExpectationCurve::default(),
    ))
    .with_train_latency(Duration::from_millis(200));
    let source = service.insert_frame("src", frame(1_000));
    let session = Session::connect(
        service,
        &ClusterConfig::default(),
        Timeouts::default(),
        Duration::from_millis(20),
        RetryPolicy::none(),
    )
    .await
    .unwrap();
    let partition = Partitioner::default()
        .partition(&session, &source, &table)
        .await
        .unwrap();

    let mut log = TrialLog::new();
    let err = controller(9)
        .run(&session, &table, &partition, &mut log)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceTimeout { ref operation, .. } if operation == "train"));
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_failed_trial_keys_released_on_close() {
    let fixture = fixture(
        1_000,
        |e, table| {
            let (train, score) = errors(1);
            e.with_step(table.get(1), train, score + 0.01)
        },
        Duration::from_secs(5),
    )
    .await;
    let (_, result) = run(&fixture, 9).await;
    assert!(result.is_err());

    let owned = fixture.session.owned_keys();
    assert!(owned.contains(&"r1".to_string()));
    assert!(owned.contains(&"model_1".to_string()));

    let service = fixture.session.close().await;
    assert_eq!(service.model_count(), 0);
    // Only the source, which the session never owned.
    assert_eq!(service.frame_count(), 1);
}
