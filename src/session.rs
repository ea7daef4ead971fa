//! Service session
//!
//! A [`Session`] is the explicit context every service call goes through.
//! It owns the service handle, applies the per-call time bounds, retries the
//! score call on transient unavailability, and remembers which keys it
//! created so [`Session::close`] can release them.
//!
//! ## Lifecycle
//!
//! ```text
//! connect ──> import / filter / slice / train / score / predict ... ──> close
//!   │                                                                   │
//!   └─ checks cloud size and health                  releases owned keys ┘
//! ```

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::config::{ClusterConfig, RetryPolicy, Timeouts};
use crate::service::{
    CloudStatus, DatasetHandle, ImportRequest, Model, PredictionHandle, SamplingGuarantee,
    ScoreRequest, ScoringResult, TrainRequest, TrainingService,
};
use crate::{Error, Result};

/// Run `future`, failing with [`Error::ServiceTimeout`] if it exceeds `bound`.
///
/// # Errors
///
/// Returns the future's own error, or a timeout error.
pub async fn with_timeout<T, F>(operation: &str, bound: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(bound, future)
        .await
        .map_err(|_| Error::ServiceTimeout {
            operation: operation.to_string(),
            timeout: bound,
        })?
}

/// Run `call` until it succeeds, fails non-transiently, or `policy` runs out
/// of attempts, sleeping `policy.delay()` between attempts.
///
/// # Errors
///
/// Returns the first non-transient error, or [`Error::ServiceUnavailable`]
/// with the attempt count once attempts are exhausted.
pub async fn with_retry<T, F, Fut>(operation: &str, policy: RetryPolicy, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(operation, attempt, max_attempts, error = %e, "retrying");
                tokio::time::sleep(policy.delay()).await;
                attempt += 1;
            }
            Err(Error::ServiceUnavailable { message, .. }) => {
                return Err(Error::ServiceUnavailable {
                    operation: operation.to_string(),
                    attempts: attempt,
                    message,
                });
            }
            other => return other,
        }
    }
}

/// Connected service plus the bounds and policy applied to every call.
pub struct Session<S> {
    service: S,
    cloud: CloudStatus,
    timeouts: Timeouts,
    model_timeout: Duration,
    retry: RetryPolicy,
    owned: Mutex<Vec<String>>,
}

impl<S: TrainingService> Session<S> {
    /// Connect to a running cloud and check it has the expected size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the cloud is smaller than
    /// `cluster.node_count` or unhealthy, and propagates service errors.
    pub async fn connect(
        service: S,
        cluster: &ClusterConfig,
        timeouts: Timeouts,
        model_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let cloud = with_timeout("cloud_status", timeouts.short(), service.cloud_status()).await?;
        if cloud.node_count < cluster.node_count {
            return Err(Error::Configuration(format!(
                "cloud '{}' has {} node(s), expected {}",
                cloud.name, cloud.node_count, cluster.node_count
            )));
        }
        if !cloud.healthy {
            return Err(Error::Configuration(format!(
                "cloud '{}' is not healthy",
                cloud.name
            )));
        }
        tracing::info!(
            cloud = %cloud.name,
            nodes = cloud.node_count,
            java_heap_gb = cluster.java_heap_gb,
            "connected"
        );

        Ok(Self {
            service,
            cloud,
            timeouts,
            model_timeout,
            retry,
            owned: Mutex::new(Vec::new()),
        })
    }

    /// Cloud status seen at connect time.
    #[must_use]
    pub const fn cloud(&self) -> &CloudStatus {
        &self.cloud
    }

    /// The underlying service.
    #[must_use]
    pub const fn service(&self) -> &S {
        &self.service
    }

    /// Bound for train, score and predict calls.
    #[must_use]
    pub const fn model_timeout(&self) -> Duration {
        self.model_timeout
    }

    /// Disjointness promise of the service's sampling primitive.
    #[must_use]
    pub fn sampling_guarantee(&self) -> SamplingGuarantee {
        self.service.sampling_guarantee()
    }

    /// Keys created through this session and not yet released.
    #[must_use]
    pub fn owned_keys(&self) -> Vec<String> {
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn track(&self, key: &str) {
        let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
        if !owned.iter().any(|k| k == key) {
            owned.push(key.to_string());
        }
    }

    fn untrack(&self, key: &str) {
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|k| k != key);
    }

    /// Import and parse the input file.
    ///
    /// # Errors
    ///
    /// Propagates service errors and timeouts.
    pub async fn import_parse(&self, request: &ImportRequest) -> Result<DatasetHandle> {
        let handle = with_timeout(
            "import_parse",
            self.timeouts.import(),
            self.service.import_parse(request),
        )
        .await?;
        self.track(&handle.key);
        Ok(handle)
    }

    /// Inspect an existing frame.
    ///
    /// # Errors
    ///
    /// Propagates service errors and timeouts.
    pub async fn inspect(&self, key: &str) -> Result<DatasetHandle> {
        with_timeout("inspect", self.timeouts.short(), self.service.inspect(key)).await
    }

    /// Seeded random filter.
    ///
    /// # Errors
    ///
    /// Propagates service errors and timeouts.
    pub async fn random_filter(
        &self,
        source: &DatasetHandle,
        rows: u64,
        seed: u64,
        dest_key: &str,
    ) -> Result<DatasetHandle> {
        let handle = with_timeout(
            "random_filter",
            self.timeouts.short(),
            self.service.random_filter(source, rows, seed, dest_key),
        )
        .await?;
        self.track(&handle.key);
        Ok(handle)
    }

    /// Positional slice `start..=end` (1-based).
    ///
    /// # Errors
    ///
    /// Propagates service errors and timeouts.
    pub async fn slice(
        &self,
        source: &DatasetHandle,
        start: u64,
        end: u64,
        dest_key: &str,
    ) -> Result<DatasetHandle> {
        let handle = with_timeout(
            "slice",
            self.timeouts.short(),
            self.service.slice(source, start, end, dest_key),
        )
        .await?;
        self.track(&handle.key);
        Ok(handle)
    }

    /// Train a model. Not retried.
    ///
    /// # Errors
    ///
    /// Propagates service errors and timeouts.
    pub async fn train(&self, request: &TrainRequest) -> Result<Model> {
        let model = with_timeout("train", self.model_timeout, self.service.train(request)).await?;
        self.track(&model.model_key);
        Ok(model)
    }

    /// Score a model, retrying transient unavailability per the policy.
    /// Each attempt gets the full model timeout.
    ///
    /// # Errors
    ///
    /// Propagates service errors and timeouts; unavailability once the
    /// retry policy is exhausted.
    pub async fn score(&self, request: &ScoreRequest) -> Result<ScoringResult> {
        with_retry("score", self.retry, || {
            with_timeout("score", self.model_timeout, self.service.score(request))
        })
        .await
    }

    /// Generate predictions. Not retried.
    ///
    /// # Errors
    ///
    /// Propagates service errors and timeouts.
    pub async fn generate_predictions(
        &self,
        model_key: &str,
        data: &DatasetHandle,
    ) -> Result<PredictionHandle> {
        let handle = with_timeout(
            "predict",
            self.model_timeout,
            self.service.generate_predictions(model_key, data),
        )
        .await?;
        self.track(&handle.key);
        Ok(handle)
    }

    /// Release a key. Failures are logged, not returned.
    pub async fn release(&self, key: &str) {
        match with_timeout("remove", self.timeouts.short(), self.service.remove(key)).await {
            Ok(()) => self.untrack(key),
            Err(e) => tracing::warn!(key, error = %e, "failed to release"),
        }
    }

    /// Release every key still owned and end the session.
    pub async fn close(self) -> S {
        for key in self.owned_keys() {
            self.release(&key).await;
        }
        tracing::info!(cloud = %self.cloud.name, "session closed");
        self.service
    }
}
