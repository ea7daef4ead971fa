//! In-process service backend.
//!
//! Frames are Arrow `RecordBatch`es held in a `DashMap`. The data plane
//! (import, random filter, slice, remove) is real; the model plane has no
//! trees behind it and takes its error rates from an [`Evaluator`].

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, ArrayRef, Int64Array, UInt64Array};
use arrow::compute::{cast, concat_batches, take_record_batch};
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{
    CloudStatus, ConfusionMatrix, DatasetHandle, ImportRequest, Model, PredictionHandle,
    SamplingGuarantee, ScoreRequest, ScoringResult, TrainRequest, TrainingService,
};
use crate::validate::ExpectationCurve;
use crate::window::RowWindowTable;
use crate::{Error, Result};

/// Records read when inferring a CSV schema.
const INFER_SCHEMA_RECORDS: usize = 1000;

/// What the evaluator sees about a trained model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitSummary {
    /// Model key
    pub model_key: String,
    /// Frame the model was trained on
    pub data_key: String,
    /// Rows in the training frame
    pub train_rows: u64,
    /// Trees requested
    pub ntree: u32,
}

/// Supplies classification error rates for the in-process backend.
pub trait Evaluator: Send + Sync {
    /// Out-of-bag error of a freshly trained model.
    fn oobe_error(&self, fit: &FitSummary) -> f64;

    /// Error of a model scored against `scored_rows` held-out rows.
    fn score_error(&self, fit: &FitSummary, scored_rows: u64) -> f64;
}

/// Step-function evaluator keyed by training rows.
///
/// A model trained on `n` rows gets the error of the largest step whose row
/// count is `<= n` (or the first step if `n` is below all of them).
#[derive(Debug, Clone, PartialEq)]
pub struct CurveEvaluator {
    steps: Vec<(u64, f64, f64)>,
}

impl CurveEvaluator {
    /// Same error rates regardless of training size.
    #[must_use]
    pub fn constant(train_error: f64, score_error: f64) -> Self {
        Self {
            steps: vec![(0, train_error, score_error)],
        }
    }

    /// Reproduce an expectation curve exactly at each decile of `table`.
    #[must_use]
    pub fn from_expectations(table: &RowWindowTable, curve: &ExpectationCurve) -> Self {
        let steps = (1..=9)
            .map(|i| {
                (
                    table.get(i),
                    1.0 - curve.train(i) / 100.0,
                    1.0 - curve.score(i) / 100.0,
                )
            })
            .collect();
        Self { steps }
    }

    /// Add (or replace) a step.
    #[must_use]
    pub fn with_step(mut self, rows: u64, train_error: f64, score_error: f64) -> Self {
        self.steps.retain(|(r, _, _)| *r != rows);
        self.steps.push((rows, train_error, score_error));
        self.steps.sort_by_key(|(r, _, _)| *r);
        self
    }

    fn lookup(&self, train_rows: u64) -> (f64, f64) {
        self.steps
            .iter()
            .rev()
            .find(|(rows, _, _)| *rows <= train_rows)
            .or_else(|| self.steps.first())
            .map_or((0.0, 0.0), |(_, train, score)| (*train, *score))
    }
}

impl Evaluator for CurveEvaluator {
    fn oobe_error(&self, fit: &FitSummary) -> f64 {
        self.lookup(fit.train_rows).0
    }

    fn score_error(&self, fit: &FitSummary, _scored_rows: u64) -> f64 {
        self.lookup(fit.train_rows).1
    }
}

#[derive(Debug, Clone)]
struct StoredModel {
    fit: FitSummary,
    response_column: usize,
    oobe_error: f64,
}

/// In-process training service.
///
/// # Example
///
/// ```rust
/// use oobe_harness::service::{CurveEvaluator, MemoryService, TrainingService};
///
/// # async fn example() -> oobe_harness::Result<()> {
/// let service = MemoryService::new(CurveEvaluator::constant(0.08, 0.05));
/// let status = service.cloud_status().await?;
/// assert!(status.healthy);
/// # Ok(())
/// # }
/// ```
pub struct MemoryService<E = CurveEvaluator> {
    evaluator: E,
    cloud: CloudStatus,
    frames: DashMap<String, RecordBatch>,
    /// File and header flag each imported frame was parsed from
    sources: DashMap<String, (PathBuf, bool)>,
    models: DashMap<String, StoredModel>,
    train_calls: AtomicUsize,
    score_calls: AtomicUsize,
    failing_scores: AtomicU32,
    train_latency: Option<Duration>,
}

impl<E: Evaluator> MemoryService<E> {
    /// Create an empty service backed by `evaluator`.
    #[must_use]
    pub fn new(evaluator: E) -> Self {
        Self {
            evaluator,
            cloud: CloudStatus {
                name: "in-process".to_string(),
                node_count: 1,
                healthy: true,
            },
            frames: DashMap::new(),
            sources: DashMap::new(),
            models: DashMap::new(),
            train_calls: AtomicUsize::new(0),
            score_calls: AtomicUsize::new(0),
            failing_scores: AtomicU32::new(0),
            train_latency: None,
        }
    }

    /// Delay every train call (for exercising timeouts).
    #[must_use]
    pub const fn with_train_latency(mut self, latency: Duration) -> Self {
        self.train_latency = Some(latency);
        self
    }

    /// Report `cloud` from `cloud_status`.
    #[must_use]
    pub fn with_cloud_status(mut self, cloud: CloudStatus) -> Self {
        self.cloud = cloud;
        self
    }

    /// Swap the evaluator, keeping stored frames and models.
    #[must_use]
    pub fn with_evaluator<F: Evaluator>(self, evaluator: F) -> MemoryService<F> {
        MemoryService {
            evaluator,
            cloud: self.cloud,
            frames: self.frames,
            sources: self.sources,
            models: self.models,
            train_calls: self.train_calls,
            score_calls: self.score_calls,
            failing_scores: self.failing_scores,
            train_latency: self.train_latency,
        }
    }

    /// Make the next `count` score calls fail as unavailable.
    pub fn fail_next_scores(&self, count: u32) {
        self.failing_scores.store(count, Ordering::SeqCst);
    }

    /// Store a frame directly, bypassing import.
    pub fn insert_frame(&self, key: impl Into<String>, batch: RecordBatch) -> DatasetHandle {
        let key = key.into();
        let handle = handle_for(&key, &batch);
        self.sources.remove(&key);
        self.frames.insert(key, batch);
        handle
    }

    /// Clone of a stored frame.
    #[must_use]
    pub fn frame(&self, key: &str) -> Option<RecordBatch> {
        self.frames.get(key).map(|f| f.value().clone())
    }

    /// Number of stored frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of stored models.
    #[must_use]
    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Train calls received so far.
    #[must_use]
    pub fn train_calls(&self) -> usize {
        self.train_calls.load(Ordering::SeqCst)
    }

    /// Score calls received so far (including failed ones).
    #[must_use]
    pub fn score_calls(&self) -> usize {
        self.score_calls.load(Ordering::SeqCst)
    }

    /// Count rows of frame `a` whose `column` value also occurs in frame `b`.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame or the column is missing, or the column
    /// cannot be cast to a 64-bit integer.
    pub fn overlap(&self, a: &str, b: &str, column: &str) -> Result<u64> {
        let left = self.int_column(a, column)?;
        let right: HashSet<i64> = self.int_column(b, column)?.into_iter().collect();
        Ok(left.iter().filter(|v| right.contains(v)).count() as u64)
    }

    fn int_column(&self, key: &str, column: &str) -> Result<Vec<i64>> {
        let batch = self.get_frame("overlap", key)?;
        let array = batch
            .column_by_name(column)
            .ok_or_else(|| Error::service("overlap", format!("frame {key} has no column {column}")))?;
        let array = cast(array, &DataType::Int64)?;
        let ints = array
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| Error::service("overlap", "cast to Int64 failed"))?;
        Ok(ints.iter().flatten().collect())
    }

    fn get_frame(&self, operation: &str, key: &str) -> Result<RecordBatch> {
        self.frames
            .get(key)
            .map(|f| f.value().clone())
            .ok_or_else(|| Error::service(operation, format!("no frame named {key}")))
    }
}

impl Default for MemoryService<CurveEvaluator> {
    fn default() -> Self {
        Self::new(CurveEvaluator::constant(0.0, 0.0))
    }
}

fn handle_for(key: &str, batch: &RecordBatch) -> DatasetHandle {
    DatasetHandle {
        key: key.to_string(),
        num_rows: batch.num_rows() as u64,
        num_cols: batch.num_columns(),
    }
}

fn read_csv(path: &Path, header: bool) -> Result<RecordBatch> {
    let mut file = open_input(path)?;
    let format = Format::default().with_header(header);
    let (schema, _) = format.infer_schema(&mut file, Some(INFER_SCHEMA_RECORDS))?;
    file.seek(SeekFrom::Start(0))?;

    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(schema.clone())
        .with_header(header)
        .build(file)?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}

fn read_parquet(path: &Path) -> Result<RecordBatch> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let file = open_input(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::service("import_parse", format!("Failed to parse Parquet file: {e}")))?;
    let schema = builder.schema().clone();
    let reader = builder
        .build()
        .map_err(|e| Error::service("import_parse", format!("Failed to create Parquet reader: {e}")))?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}

fn open_input(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        Error::Configuration(format!("dataset {} cannot be opened: {e}", path.display()))
    })
}

/// Confusion counts for an integer response column: each class misclassifies
/// `error` of its rows as the next class. `None` if the column is not
/// integral.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn confusion_counts(response: &ArrayRef, error: f64) -> Option<Vec<Vec<u64>>> {
    if !response.data_type().is_integer() {
        return None;
    }
    let values = cast(response, &DataType::Int64).ok()?;
    let values = values.as_any().downcast_ref::<Int64Array>()?;
    let mut per_class: BTreeMap<i64, u64> = BTreeMap::new();
    for v in values.iter().flatten() {
        *per_class.entry(v).or_default() += 1;
    }

    let k = per_class.len();
    let mut counts = vec![vec![0u64; k]; k];
    for (class, total) in per_class.values().enumerate() {
        let wrong = if k > 1 {
            ((*total as f64) * error.clamp(0.0, 1.0)).round() as u64
        } else {
            0
        };
        counts[class][class] = total - wrong;
        counts[class][(class + 1) % k] += wrong;
    }
    Some(counts)
}

/// Classification error after each tree, converging on `final_error`.
#[allow(clippy::cast_precision_loss)]
fn tree_error_curve(final_error: f64, ntree: u32) -> Vec<f64> {
    let n = f64::from(ntree.max(1));
    (1..=ntree)
        .map(|k| (final_error * (2.0 - f64::from(k) / n)).min(1.0))
        .collect()
}

impl<E: Evaluator> TrainingService for MemoryService<E> {
    async fn cloud_status(&self) -> Result<CloudStatus> {
        Ok(self.cloud.clone())
    }

    async fn import_parse(&self, request: &ImportRequest) -> Result<DatasetHandle> {
        let path = Path::new(&request.bucket).join(&request.path);
        let source = (path, request.header);
        // A frame already parsed from the same file under the same key is reused.
        if self
            .sources
            .get(&request.hex_key)
            .is_some_and(|s| *s.value() == source)
        {
            if let Some(batch) = self.frame(&request.hex_key) {
                tracing::debug!(key = %request.hex_key, "reusing parsed frame");
                return Ok(handle_for(&request.hex_key, &batch));
            }
        }

        let (path, header) = source;
        let is_parquet = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"));
        let batch = if is_parquet {
            read_parquet(&path)?
        } else {
            read_csv(&path, header)?
        };
        tracing::debug!(
            key = %request.hex_key,
            rows = batch.num_rows(),
            cols = batch.num_columns(),
            "parsed {}",
            path.display()
        );
        let handle = self.insert_frame(request.hex_key.clone(), batch);
        self.sources.insert(request.hex_key.clone(), (path, header));
        Ok(handle)
    }

    async fn inspect(&self, key: &str) -> Result<DatasetHandle> {
        let batch = self.get_frame("inspect", key)?;
        Ok(handle_for(key, &batch))
    }

    async fn random_filter(
        &self,
        source: &DatasetHandle,
        rows: u64,
        seed: u64,
        dest_key: &str,
    ) -> Result<DatasetHandle> {
        let batch = self.get_frame("random_filter", &source.key)?;
        let available = batch.num_rows();
        let requested = usize::try_from(rows).unwrap_or(usize::MAX);
        let amount = requested.min(available);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut picked = rand::seq::index::sample(&mut rng, available, amount).into_vec();
        // Keep source order so slicing the result is positional over the source.
        picked.sort_unstable();
        let indices = UInt64Array::from_iter_values(picked.into_iter().map(|i| i as u64));
        let sampled = take_record_batch(&batch, &indices)?;

        tracing::debug!(
            source = %source.key,
            dest = dest_key,
            requested = rows,
            selected = amount,
            seed,
            "random filter"
        );
        Ok(self.insert_frame(dest_key, sampled))
    }

    async fn slice(
        &self,
        source: &DatasetHandle,
        start: u64,
        end: u64,
        dest_key: &str,
    ) -> Result<DatasetHandle> {
        let batch = self.get_frame("slice", &source.key)?;
        let num_rows = batch.num_rows() as u64;
        if start == 0 || end < start || end > num_rows {
            return Err(Error::service(
                "slice",
                format!("rows {start}..={end} out of range for {} ({num_rows} rows)", source.key),
            ));
        }
        let offset = usize::try_from(start - 1)
            .map_err(|_| Error::service("slice", "start row overflows usize"))?;
        let length = usize::try_from(end - start + 1)
            .map_err(|_| Error::service("slice", "row count overflows usize"))?;
        Ok(self.insert_frame(dest_key, batch.slice(offset, length)))
    }

    async fn train(&self, request: &TrainRequest) -> Result<Model> {
        self.train_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.train_latency {
            tokio::time::sleep(latency).await;
        }

        let batch = self.get_frame("train", &request.data.key)?;
        let params = &request.hyperparameters;
        let num_cols = batch.num_columns();
        if params.response_column() >= num_cols {
            return Err(Error::service(
                "train",
                format!(
                    "response column {} out of range ({num_cols} columns)",
                    params.response_column()
                ),
            ));
        }
        if let Some(col) = params.ignored_columns().iter().find(|c| **c >= num_cols) {
            return Err(Error::service(
                "train",
                format!("ignored column {col} out of range ({num_cols} columns)"),
            ));
        }

        let fit = FitSummary {
            model_key: request.model_key.clone(),
            data_key: request.data.key.clone(),
            train_rows: batch.num_rows() as u64,
            ntree: params.ntree(),
        };
        let oobe_error = self.evaluator.oobe_error(&fit);
        let model = Model {
            model_key: fit.model_key.clone(),
            data_key: fit.data_key.clone(),
            ntree: fit.ntree,
            confusion_matrix: ConfusionMatrix::from_error(oobe_error),
        };
        self.models.insert(
            request.model_key.clone(),
            StoredModel {
                fit,
                response_column: params.response_column(),
                oobe_error,
            },
        );
        Ok(model)
    }

    async fn score(&self, request: &ScoreRequest) -> Result<ScoringResult> {
        self.score_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_scores
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::unavailable("score", "injected unavailability"));
        }

        let model = self
            .models
            .get(&request.model_key)
            .map(|m| m.value().clone())
            .ok_or_else(|| Error::service("score", format!("no model named {}", request.model_key)))?;
        if request.ntree > model.fit.ntree {
            return Err(Error::service(
                "score",
                format!("model has {} trees, asked for {}", model.fit.ntree, request.ntree),
            ));
        }
        let batch = self.get_frame("score", &request.data.key)?;
        let scored_rows = batch.num_rows() as u64;
        if model.response_column >= batch.num_columns() {
            return Err(Error::service("score", "frame lacks the response column"));
        }

        let error = if request.out_of_bag {
            model.oobe_error
        } else {
            self.evaluator.score_error(&model.fit, scored_rows)
        };
        let tree_errors = if request.iterative_cm {
            tree_error_curve(error, request.ntree)
        } else {
            Vec::new()
        };

        Ok(ScoringResult {
            model_key: request.model_key.clone(),
            data_key: request.data.key.clone(),
            ntree: request.ntree,
            confusion_matrix: ConfusionMatrix {
                classification_error: error,
                counts: confusion_counts(batch.column(model.response_column), error),
            },
            tree_errors,
            total_scored: scored_rows,
        })
    }

    async fn generate_predictions(
        &self,
        model_key: &str,
        data: &DatasetHandle,
    ) -> Result<PredictionHandle> {
        let model = self
            .models
            .get(model_key)
            .map(|m| m.value().clone())
            .ok_or_else(|| Error::service("predict", format!("no model named {model_key}")))?;
        let batch = self.get_frame("predict", &data.key)?;
        if model.response_column >= batch.num_columns() {
            return Err(Error::service("predict", "frame lacks the response column"));
        }

        // No trees to evaluate: the prediction frame echoes the response column.
        let column = batch.column(model.response_column).clone();
        let schema = Schema::new(vec![Field::new(
            "predict",
            column.data_type().clone(),
            column.is_nullable(),
        )]);
        let predictions = RecordBatch::try_new(Arc::new(schema), vec![column])?;

        let key = format!("{model_key}_predict_{}", data.key);
        let handle = self.insert_frame(key, predictions);
        Ok(PredictionHandle {
            key: handle.key,
            num_rows: handle.num_rows,
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.frames.remove(key);
        self.sources.remove(key);
        self.models.remove(key);
        Ok(())
    }

    fn sampling_guarantee(&self) -> SamplingGuarantee {
        // Each draw reseeds independently, so a reused seed can pick the same rows.
        SamplingGuarantee::MayOverlap
    }
}
