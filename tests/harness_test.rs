//! End-to-end runs: CSV import through report, in-process backend

use std::io::Write;
use std::path::Path;

use oobe_harness::config::{HarnessConfig, HyperparameterConfig};
use oobe_harness::harness::Harness;
use oobe_harness::report::RunStatus;
use oobe_harness::service::{CurveEvaluator, ImportRequest, MemoryService, TrainingService};
use oobe_harness::validate::ExpectationCurve;
use oobe_harness::window::RowWindowTable;
use oobe_harness::Error;

const ROWS: u64 = 2_000;

fn write_dataset(dir: &Path) {
    let mut file = std::fs::File::create(dir.join("covtype.csv")).unwrap();
    for i in 0..ROWS {
        writeln!(file, "{i},{}", i % 7 + 1).unwrap();
    }
}

fn config(dir: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::new(dir.to_string_lossy(), "covtype.csv", false);
    config.hyperparameters = HyperparameterConfig::builder()
        .response_column(1)
        .ignored_columns(Vec::new())
        .build()
        .unwrap();
    config.retry.delay_ms = 1;
    config.report_path = Some(dir.join("reports").join("run.json"));
    config
}

fn evaluator() -> CurveEvaluator {
    let table = RowWindowTable::new(ROWS).unwrap();
    CurveEvaluator::from_expectations(&table, &ExpectationCurve::default())
}

fn read_report(dir: &Path) -> serde_json::Value {
    let content = std::fs::read_to_string(dir.join("reports").join("run.json")).unwrap();
    serde_json::from_str(&content).unwrap()
}

#[tokio::test]
async fn test_full_run_passes_and_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());

    let harness = Harness::new(config(dir.path())).unwrap();
    let outcome = harness.run(MemoryService::new(evaluator())).await;
    assert!(outcome.is_success(), "{:?}", outcome.error());

    let report = outcome.report();
    assert_eq!(report.status(), RunStatus::Passed);
    assert_eq!(report.trials_completed(), 9);
    assert_eq!(report.num_rows(), Some(ROWS));
    assert!(report.train_delta().iter().all(|d| *d < 1e-9));
    assert!(report.score_delta().iter().all(|d| *d < 1e-9));
    assert!(report.actual_train()[0].abs() < f64::EPSILON);

    // Session close releases everything it created, the imported frame included.
    let service = outcome.service().unwrap();
    assert_eq!(service.frame_count(), 0);
    assert_eq!(service.model_count(), 0);
    assert_eq!(service.train_calls(), 9);

    let json = read_report(dir.path());
    assert_eq!(json["status"], "passed");
    assert_eq!(json["trials_completed"], 9);
    assert_eq!(json["windows"][1], 200);
    assert_eq!(json["windows"][9], 1_800);
}

#[tokio::test]
async fn test_run_reuses_frame_parsed_before_connect() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let config = config(dir.path());

    // Size the curves from a first parse, then swap in the evaluator.
    let dataset = &config.dataset;
    let request = ImportRequest::new(
        dataset.bucket.clone(),
        dataset.path.clone(),
        dataset.header,
        dataset.hex_key(),
    );
    let service = MemoryService::default();
    let parsed = service.import_parse(&request).await.unwrap();
    assert_eq!(parsed.num_rows, ROWS);
    let service = service.with_evaluator(evaluator());
    std::fs::remove_file(dir.path().join("covtype.csv")).unwrap();

    let outcome = Harness::new(config).unwrap().run(service).await;
    assert!(outcome.is_success(), "{:?}", outcome.error());
    assert_eq!(outcome.report().trials_completed(), 9);
    assert_eq!(outcome.service().unwrap().frame_count(), 0);
}

#[tokio::test]
async fn test_failed_run_writes_partial_report() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());

    let table = RowWindowTable::new(ROWS).unwrap();
    let curve = ExpectationCurve::default();
    let skewed = evaluator().with_step(
        table.get(5),
        1.0 - (curve.train(5) + 0.5) / 100.0,
        1.0 - curve.score(5) / 100.0,
    );

    let harness = Harness::new(config(dir.path())).unwrap();
    let outcome = harness.run(MemoryService::new(skewed)).await;

    assert_eq!(outcome.error().and_then(Error::failed_trial), Some(5));
    let report = outcome.report();
    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(report.trials_completed(), 4);
    assert_eq!(report.failed_trial(), Some(5));
    assert!(report.actual_train()[4] > 0.0);
    assert!(report.actual_train()[5..].iter().all(|v| *v == 0.0));
    assert_eq!(outcome.service().unwrap().train_calls(), 5);

    let json = read_report(dir.path());
    assert_eq!(json["status"], "failed");
    assert_eq!(json["failed_trial"], 5);
    assert!(json["failure"].as_str().unwrap().contains("train accuracy"));
}

#[tokio::test]
async fn test_fewer_trials() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let mut config = config(dir.path());
    config.trials = 3;

    let outcome = Harness::new(config)
        .unwrap()
        .run(MemoryService::new(evaluator()))
        .await;
    let report = outcome.into_result().unwrap();
    assert_eq!(report.trials_completed(), 3);
    assert!(report.actual_score()[3] > 0.0);
    assert!(report.actual_score()[4].abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_required_disjoint_partition_refused() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let mut config = config(dir.path());
    config.require_disjoint_partition = true;

    let outcome = Harness::new(config)
        .unwrap()
        .run(MemoryService::new(evaluator()))
        .await;
    assert!(matches!(outcome.error(), Some(Error::Configuration(_))));
    assert_eq!(outcome.report().trials_completed(), 0);
    assert_eq!(outcome.service().unwrap().train_calls(), 0);
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harness.json");
    std::fs::write(
        &path,
        serde_json::json!({
            "dataset": { "bucket": "home-0xdiag-datasets", "path": "standard/covtype.data", "header": false },
            "cluster": { "node_count": 1, "java_heap_gb": 10 },
            "trials": 9,
            "tolerances": { "train_accuracy": 0.2, "score_accuracy": 0.2 }
        })
        .to_string(),
    )
    .unwrap();

    let config = HarnessConfig::load(&path).unwrap();
    assert_eq!(config.dataset.hex_key(), "covtype.data.hex");
    assert_eq!(config.seed, 12_345);
    assert_eq!(config.model_timeout().as_secs(), 230);
    assert!(Harness::new(config).is_ok());
}
