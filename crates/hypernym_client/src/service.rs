use std::fmt::Debug;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use adaptive_batch::adaptive_concurrency::http::HttpError;
use adaptive_batch::{CompressionRequest, ProcessingMode, RawResponse};
use futures::future::BoxFuture;
use http::StatusCode;
use tokio::time::Instant;
use tower::Service;
use url::Url;

use crate::config::{ConfigError, HypernymConfig};
use crate::payload::{AnalyzePayload, TaskStarted, TaskStatus};

pub(crate) const API_KEY_HEADER: &str = "X-API-Key";
/// Budget of the short calls that start and poll an async task.
const TASK_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct Endpoints {
    pub(crate) sync: Url,
    pub(crate) begin: Url,
    pub(crate) rate_limits: Url,
}

pub(crate) struct Inner {
    pub(crate) client: reqwest::Client,
    pub(crate) config: HypernymConfig,
    pub(crate) endpoints: Endpoints,
}

/// Endpoint service for [`adaptive_batch::BatchOrchestrator`].
///
/// Non-2xx answers are returned as a [`RawResponse`] so the core can tell a
/// rate limit from a server error. Only failures to talk to the server at
/// all become errors.
#[derive(Clone)]
pub struct HypernymService {
    pub(crate) inner: Arc<Inner>,
}

impl Debug for HypernymService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypernymService")
            .field("api_url", &self.inner.config.api_url.as_str())
            .field("poll_interval", &self.inner.config.poll_interval)
            .field("max_wait", &self.inner.config.max_wait)
            .finish_non_exhaustive()
    }
}

impl HypernymService {
    pub fn new(config: HypernymConfig) -> Result<Self, ConfigError> {
        let client = config.build_client()?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: HypernymConfig, client: reqwest::Client) -> Result<Self, ConfigError> {
        let endpoints = Endpoints {
            sync: config.api_url.clone(),
            begin: config.sibling(&["analyze_begin"])?,
            rate_limits: config.sibling(&["user", "rate-limits"])?,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                config,
                endpoints,
            }),
        })
    }

    pub fn config(&self) -> &HypernymConfig {
        &self.inner.config
    }
}

impl Service<CompressionRequest> for HypernymService {
    type Response = RawResponse;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: CompressionRequest) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            match request.processing_mode() {
                ProcessingMode::Sync => inner.analyze_sync(&request).await,
                ProcessingMode::Async => inner.analyze_async(&request).await,
            }
        })
    }
}

impl Inner {
    async fn analyze_sync(&self, request: &CompressionRequest) -> Result<RawResponse, HttpError> {
        let response = self
            .client
            .post(self.endpoints.sync.clone())
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&AnalyzePayload::from_request(request))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        read_response(response).await
    }

    async fn analyze_async(&self, request: &CompressionRequest) -> Result<RawResponse, HttpError> {
        let started = Instant::now();
        let begin = self
            .client
            .post(self.endpoints.begin.clone())
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&AnalyzePayload::from_request(request))
            .timeout(TASK_CALL_TIMEOUT)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let task_id = match task_begun(read_response(begin).await?)? {
            Begun::Task(task) => task.task_id,
            Begun::Rejected(response) => return Ok(response),
        };
        let status_url = self
            .config
            .sibling(&["analyze_status", task_id.as_str()])
            .map_err(|e| HttpError::InvalidRequest { details: e.to_string() })?;
        debug!(job_id = %request.job_id, task_id = %task_id, "Started async analysis");

        let (inner, status_url) = (self, &status_url);
        let poll = move || async move {
            let polled = inner
                .client
                .get(status_url.clone())
                .header(API_KEY_HEADER, &inner.config.api_key)
                .timeout(TASK_CALL_TIMEOUT)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            read_response(polled).await
        };
        let result = wait_for_task(&task_id, started, self.config.poll_interval, self.config.max_wait, poll).await;
        if matches!(result, Err(HttpError::Timeout)) {
            warn!(
                job_id = %request.job_id,
                task_id = %task_id,
                max_wait_secs = self.config.max_wait.as_secs(),
                "Async analysis timed out"
            );
        }
        result
    }
}

/// Reply of `analyze_begin`, decided.
#[derive(Debug)]
pub(crate) enum Begun {
    Task(TaskStarted),
    /// Non-2xx reply, handed to the executor for classification.
    Rejected(RawResponse),
}

pub(crate) fn task_begun(begin: RawResponse) -> Result<Begun, HttpError> {
    if !begin.status.is_success() {
        return Ok(Begun::Rejected(begin));
    }
    decode(&begin).map(Begun::Task)
}

/// Where an async task stands after one status reply.
#[derive(Debug, PartialEq)]
pub(crate) enum TaskProgress {
    /// Final reply for the executor: the result as a 200, a task failure as
    /// a 422, or a non-2xx status reply passed through.
    Finished(RawResponse),
    Running { status: String, progress: f64 },
}

pub(crate) fn task_progress(polled: RawResponse) -> Result<TaskProgress, HttpError> {
    if !polled.status.is_success() {
        return Ok(TaskProgress::Finished(polled));
    }
    let status: TaskStatus = decode(&polled)?;
    match status.status.as_str() {
        "completed" => {
            let result = status.result.ok_or_else(|| HttpError::MalformedResponse {
                details: "completed task has no result".to_string(),
            })?;
            let body = serde_json::to_vec(&result).map_err(|e| HttpError::MalformedResponse {
                details: e.to_string(),
            })?;
            Ok(TaskProgress::Finished(RawResponse::ok(body)))
        }
        "failed" => {
            let error = status.error.unwrap_or_else(|| "processing failed".to_string());
            Ok(TaskProgress::Finished(RawResponse::new(StatusCode::UNPROCESSABLE_ENTITY, error)))
        }
        _ => Ok(TaskProgress::Running {
            progress: status.progress.unwrap_or(0.0),
            status: status.status,
        }),
    }
}

/// Polls until the task finishes. Each round sleeps `poll_interval` first,
/// then gives up with [`HttpError::Timeout`] once `max_wait` has passed
/// since `started`.
pub(crate) async fn wait_for_task<F, Fut>(
    task_id: &str,
    started: Instant,
    poll_interval: Duration,
    max_wait: Duration,
    mut poll: F,
) -> Result<RawResponse, HttpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RawResponse, HttpError>>,
{
    loop {
        tokio::time::sleep(poll_interval).await;
        if started.elapsed() >= max_wait {
            return Err(HttpError::Timeout);
        }
        match task_progress(poll().await?)? {
            TaskProgress::Finished(response) => return Ok(response),
            TaskProgress::Running { status, progress } => {
                trace!(task_id, %status, progress, "Async analysis in progress");
            }
        }
    }
}

pub(crate) async fn read_response(response: reqwest::Response) -> Result<RawResponse, HttpError> {
    let status = response.status();
    let body = response.bytes().await.map_err(map_reqwest_error)?;
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        warn!(%status, "Server error or rate limited");
    } else if status.is_client_error() {
        error!(%status, body = %String::from_utf8_lossy(&body), "Client error");
    }
    Ok(RawResponse::new(status, body))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(response: &RawResponse) -> Result<T, HttpError> {
    serde_json::from_slice(&response.body).map_err(|e| HttpError::MalformedResponse { details: e.to_string() })
}

pub(crate) fn map_reqwest_error(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout
    } else if error.is_builder() {
        HttpError::InvalidRequest {
            details: error.to_string(),
        }
    } else {
        HttpError::Transport {
            source: Box::new(error),
        }
    }
}
