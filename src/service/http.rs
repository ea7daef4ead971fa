//! REST backend for a running cluster.
//!
//! Every endpoint answers with a JSON body that may carry an `error` string
//! and a `response.status` of `done`, `poll`, `redirect` or `error`. Long
//! jobs (parse, forest build, scoring) are polled until they stop answering
//! `poll`; the session's timeout bounds the whole call.
//!
//! Status codes 502/503/504 and connection failures map to
//! [`Error::ServiceUnavailable`]; everything else that goes wrong is an
//! [`Error::Service`].

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    CloudStatus, ConfusionMatrix, DatasetHandle, ImportRequest, Model, PredictionHandle,
    SamplingGuarantee, ScoreRequest, ScoringResult, TrainRequest, TrainingService,
};
use crate::{Error, Result};

/// Delay between polls of a running job.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Reply<T> {
    #[serde(default)]
    response: Envelope,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    body: T,
}

/// `locked` is not read; an unlocked cloud is usable.
#[derive(Debug, Deserialize)]
struct CloudReply {
    cloud_name: String,
    cloud_size: u32,
    #[serde(default)]
    consensus: Option<bool>,
    #[serde(default)]
    nodes: Vec<NodeReply>,
}

#[derive(Debug, Deserialize)]
struct NodeReply {
    #[serde(default = "default_healthy")]
    healthy: bool,
}

const fn default_healthy() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ImportReply {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    fails: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FrameReply {
    #[serde(default)]
    key: Option<String>,
    num_rows: u64,
    num_cols: usize,
}

#[derive(Debug, Deserialize)]
struct JobReply {
    #[serde(default)]
    destination_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CmReply {
    classification_error: f64,
    #[serde(default)]
    scores: Option<Vec<Vec<u64>>>,
}

#[derive(Debug, Deserialize)]
struct RfViewReply {
    model_key: String,
    data_key: String,
    ntree: u32,
    confusion_matrix: CmReply,
    #[serde(default)]
    tree_errors: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct Empty {}

impl From<CloudReply> for CloudStatus {
    /// Healthy unless the nodes explicitly disagree on membership or a node
    /// reports itself unhealthy.
    fn from(cloud: CloudReply) -> Self {
        let healthy = cloud.consensus != Some(false) && cloud.nodes.iter().all(|n| n.healthy);
        Self {
            name: cloud.cloud_name,
            node_count: cloud.cloud_size,
            healthy,
        }
    }
}

impl From<CmReply> for ConfusionMatrix {
    fn from(cm: CmReply) -> Self {
        Self {
            classification_error: cm.classification_error,
            counts: cm.scores,
        }
    }
}

impl RfViewReply {
    fn into_model(self) -> Model {
        Model {
            model_key: self.model_key,
            data_key: self.data_key,
            ntree: self.ntree,
            confusion_matrix: self.confusion_matrix.into(),
        }
    }

    fn into_scoring(self, fallback_total: u64) -> ScoringResult {
        let confusion_matrix: ConfusionMatrix = self.confusion_matrix.into();
        let total_scored = confusion_matrix.total().unwrap_or(fallback_total);
        ScoringResult {
            model_key: self.model_key,
            data_key: self.data_key,
            ntree: self.ntree,
            confusion_matrix,
            tree_errors: self.tree_errors,
            total_scored,
        }
    }
}

/// `dest=randomFilter(source,rows,seed)`
fn random_filter_expr(dest: &str, source: &str, rows: u64, seed: u64) -> String {
    format!("{dest}=randomFilter({source},{rows},{seed})")
}

/// `dest=slice(source,start,end)`
fn slice_expr(dest: &str, source: &str, start: u64, end: u64) -> String {
    format!("{dest}=slice({source},{start},{end})")
}

const fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn is_unavailable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// REST client for a cluster node.
#[derive(Debug, Clone)]
pub struct HttpService {
    http: Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpService {
    /// Client for the node at `base_url` (e.g. `http://127.0.0.1:54321`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Base URL requests go to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        operation: &str,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Reply<T>> {
        tracing::debug!(operation, endpoint, ?params, "request");
        let resp = self
            .http
            .get(self.url(endpoint))
            .query(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    Error::unavailable(operation, e.to_string())
                } else {
                    Error::service(operation, e.to_string())
                }
            })?;

        let status = resp.status();
        if is_unavailable_status(status) {
            return Err(Error::unavailable(operation, format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::service(operation, format!("HTTP {status}: {body}")));
        }

        let reply: Reply<T> = resp
            .json()
            .await
            .map_err(|e| Error::service(operation, format!("malformed reply: {e}")))?;
        if let Some(message) = reply.error.as_ref() {
            return Err(Error::service(operation, message.clone()));
        }
        if reply.response.status.as_deref() == Some("error") {
            return Err(Error::service(operation, "job reported status 'error'"));
        }
        Ok(reply)
    }

    /// Re-issue a view request until the job stops polling.
    async fn poll<T: DeserializeOwned>(
        &self,
        operation: &str,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        loop {
            let reply: Reply<T> = self.get(operation, endpoint, params).await?;
            if reply.response.status.as_deref() != Some("poll") {
                return Ok(reply.body);
            }
            tracing::trace!(operation, "job still running");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn exec(&self, operation: &str, expression: String, dest: &str) -> Result<DatasetHandle> {
        let reply: Reply<FrameReply> = self
            .get(operation, "Exec.json", &[("expression", expression)])
            .await?;
        Ok(DatasetHandle {
            key: reply.body.key.unwrap_or_else(|| dest.to_string()),
            num_rows: reply.body.num_rows,
            num_cols: reply.body.num_cols,
        })
    }
}

impl TrainingService for HttpService {
    async fn cloud_status(&self) -> Result<CloudStatus> {
        let reply: Reply<CloudReply> = self.get("cloud_status", "Cloud.json", &[]).await?;
        Ok(reply.body.into())
    }

    async fn import_parse(&self, request: &ImportRequest) -> Result<DatasetHandle> {
        let path = format!("{}/{}", request.bucket.trim_end_matches('/'), request.path);
        let imported: Reply<ImportReply> = self
            .get("import_parse", "ImportFiles.json", &[("path", path.clone())])
            .await?;
        let Some(source_key) = imported.body.keys.into_iter().next() else {
            return Err(Error::Configuration(format!(
                "dataset {path} not found by the service (fails: {:?})",
                imported.body.fails
            )));
        };

        let parse: Reply<JobReply> = self
            .get(
                "import_parse",
                "Parse.json",
                &[
                    ("source_key", source_key),
                    ("destination_key", request.hex_key.clone()),
                    ("header", flag(request.header).to_string()),
                ],
            )
            .await?;
        let dest = parse
            .body
            .destination_key
            .unwrap_or_else(|| request.hex_key.clone());

        let _: Empty = self
            .poll(
                "import_parse",
                "Progress.json",
                &[("destination_key", dest.clone())],
            )
            .await?;
        self.inspect(&dest).await
    }

    async fn inspect(&self, key: &str) -> Result<DatasetHandle> {
        let reply: Reply<FrameReply> = self
            .get("inspect", "Inspect.json", &[("key", key.to_string())])
            .await?;
        Ok(DatasetHandle {
            key: key.to_string(),
            num_rows: reply.body.num_rows,
            num_cols: reply.body.num_cols,
        })
    }

    async fn random_filter(
        &self,
        source: &DatasetHandle,
        rows: u64,
        seed: u64,
        dest_key: &str,
    ) -> Result<DatasetHandle> {
        let expression = random_filter_expr(dest_key, &source.key, rows, seed);
        self.exec("random_filter", expression, dest_key).await
    }

    async fn slice(
        &self,
        source: &DatasetHandle,
        start: u64,
        end: u64,
        dest_key: &str,
    ) -> Result<DatasetHandle> {
        let expression = slice_expr(dest_key, &source.key, start, end);
        self.exec("slice", expression, dest_key).await
    }

    async fn train(&self, request: &TrainRequest) -> Result<Model> {
        let mut params = request.hyperparameters.to_params();
        params.push(("data_key", request.data.key.clone()));
        params.push(("model_key", request.model_key.clone()));
        params.push(("out_of_bag_error_estimate", flag(request.out_of_bag).to_string()));

        let _: Reply<JobReply> = self.get("train", "RF.json", &params).await?;

        let view: RfViewReply = self
            .poll(
                "train",
                "RFView.json",
                &[
                    ("model_key", request.model_key.clone()),
                    ("data_key", request.data.key.clone()),
                    ("ntree", request.hyperparameters.ntree().to_string()),
                    ("out_of_bag_error_estimate", flag(request.out_of_bag).to_string()),
                ],
            )
            .await?;
        Ok(view.into_model())
    }

    async fn score(&self, request: &ScoreRequest) -> Result<ScoringResult> {
        let view: RfViewReply = self
            .poll(
                "score",
                "RFView.json",
                &[
                    ("model_key", request.model_key.clone()),
                    ("data_key", request.data.key.clone()),
                    ("ntree", request.ntree.to_string()),
                    ("iterative_cm", flag(request.iterative_cm).to_string()),
                    ("out_of_bag_error_estimate", flag(request.out_of_bag).to_string()),
                ],
            )
            .await?;
        Ok(view.into_scoring(request.data.num_rows))
    }

    async fn generate_predictions(
        &self,
        model_key: &str,
        data: &DatasetHandle,
    ) -> Result<PredictionHandle> {
        let reply: Reply<JobReply> = self
            .get(
                "predict",
                "GeneratePredictionsPage.json",
                &[
                    ("model_key", model_key.to_string()),
                    ("data_key", data.key.clone()),
                ],
            )
            .await?;
        let key = reply
            .body
            .destination_key
            .unwrap_or_else(|| format!("{model_key}_predict_{}", data.key));
        Ok(PredictionHandle {
            key,
            num_rows: data.num_rows,
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _: Reply<Empty> = self
            .get("remove", "Remove.json", &[("key", key.to_string())])
            .await?;
        Ok(())
    }

    fn sampling_guarantee(&self) -> SamplingGuarantee {
        SamplingGuarantee::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_expressions() {
        assert_eq!(
            random_filter_expr("rTest", "covtype.data.hex", 58101, 12345),
            "rTest=randomFilter(covtype.data.hex,58101,12345)"
        );
        assert_eq!(slice_expr("r5", "rTrain", 1, 290_505), "r5=slice(rTrain,1,290505)");
    }

    #[test]
    fn test_base_url_trimmed() {
        let service = HttpService::new("http://localhost:54321/");
        assert_eq!(service.base_url(), "http://localhost:54321");
        assert_eq!(service.url("Cloud.json"), "http://localhost:54321/Cloud.json");
    }

    #[test]
    fn test_unavailable_statuses() {
        assert!(is_unavailable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_unavailable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_unavailable_status(StatusCode::NOT_FOUND));
        assert!(!is_unavailable_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn test_rfview_reply_to_scoring() {
        let json = serde_json::json!({
            "response": { "status": "done" },
            "model_key": "model_5",
            "data_key": "rTest",
            "ntree": 10,
            "confusion_matrix": {
                "classification_error": 0.25,
                "scores": [[3, 1], [1, 3]]
            },
            "tree_errors": [0.4, 0.3, 0.25]
        });
        let reply: Reply<RfViewReply> = serde_json::from_value(json).unwrap();
        assert_eq!(reply.response.status.as_deref(), Some("done"));

        let scoring = reply.body.into_scoring(99);
        assert_eq!(scoring.model_key, "model_5");
        assert_eq!(scoring.total_scored, 8);
        assert_eq!(scoring.tree_errors.len(), 3);
        assert_eq!(scoring.confusion_matrix.class_error_pct(), vec![25.0, 25.0]);
    }

    #[test]
    fn test_rfview_without_counts_falls_back() {
        let json = serde_json::json!({
            "model_key": "model_1",
            "data_key": "r1",
            "ntree": 10,
            "confusion_matrix": { "classification_error": 0.1484 }
        });
        let reply: Reply<RfViewReply> = serde_json::from_value(json).unwrap();
        assert!(reply.response.status.is_none());
        let scoring = reply.body.into_scoring(58101);
        assert_eq!(scoring.total_scored, 58101);
        assert!(scoring.tree_errors.is_empty());
    }

    fn cloud_status(json: serde_json::Value) -> CloudStatus {
        let reply: Reply<CloudReply> = serde_json::from_value(json).unwrap();
        reply.body.into()
    }

    #[test]
    fn test_fresh_cloud_is_healthy() {
        let status = cloud_status(serde_json::json!({
            "cloud_name": "oobe",
            "cloud_size": 1,
            "consensus": true,
            "locked": false,
            "nodes": [{ "healthy": true }]
        }));
        assert_eq!(status.name, "oobe");
        assert_eq!(status.node_count, 1);
        assert!(status.healthy);
    }

    #[test]
    fn test_cloud_without_consensus_fields_is_healthy() {
        let status = cloud_status(serde_json::json!({
            "cloud_name": "oobe",
            "cloud_size": 1,
            "nodes": [{}]
        }));
        assert!(status.healthy);
    }

    #[test]
    fn test_cloud_unhealthy() {
        let split = cloud_status(serde_json::json!({
            "cloud_name": "oobe",
            "cloud_size": 2,
            "consensus": false,
            "nodes": [{ "healthy": true }, { "healthy": true }]
        }));
        assert!(!split.healthy);

        let sick_node = cloud_status(serde_json::json!({
            "cloud_name": "oobe",
            "cloud_size": 2,
            "consensus": true,
            "locked": true,
            "nodes": [{ "healthy": true }, { "healthy": false }]
        }));
        assert_eq!(sick_node.node_count, 2);
        assert!(!sick_node.healthy);
    }

    /// Serve one HTTP response with `body`, returning the base URL.
    async fn serve_once(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\
                 Connection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_connect_to_fresh_cloud() {
        use crate::config::{ClusterConfig, RetryPolicy, Timeouts};
        use crate::session::Session;

        let base_url = serve_once(
            r#"{"cloud_name":"oobe","cloud_size":1,"consensus":true,"locked":false,"nodes":[{"healthy":true}]}"#,
        )
        .await;
        let session = Session::connect(
            HttpService::new(base_url),
            &ClusterConfig::default(),
            Timeouts::default(),
            Duration::from_secs(5),
            RetryPolicy::none(),
        )
        .await
        .unwrap();
        assert_eq!(session.cloud().name, "oobe");
        assert!(session.cloud().healthy);
    }
}
