//! One job, start to finish: attempts, classification and retries.

use std::sync::Arc;
use std::time::Duration;

use tower::timeout::Timeout;
use tower::{Service, ServiceExt};

use super::events::{ProgressEvent, ProgressSink};
use super::job::{JobId, ProcessingMode, RequestConfig};
use super::outcome::Outcome;
use crate::adaptive_concurrency::controller::ConcurrencyController;
use crate::adaptive_concurrency::http::{Compressed, HttpError, RawResponse, classify_response};
use crate::adaptive_concurrency::instant_now;
use crate::adaptive_concurrency::retries::{DefaultRetryLogic, RetryAction, RetryLogic, RetrySettings, RetryState};

/// What the endpoint service receives for one attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressionRequest {
    pub job_id: JobId,
    pub text: Arc<str>,
    pub config: RequestConfig,
    /// Budget of this attempt. Services may forward it to the server; for
    /// sync-mode requests the executor also enforces it.
    pub timeout: Duration,
}

impl CompressionRequest {
    pub fn new(job_id: JobId, text: impl Into<Arc<str>>, config: RequestConfig) -> Self {
        let timeout = config.timeout;
        Self {
            job_id,
            text: text.into(),
            config,
            timeout,
        }
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.config.processing_mode
    }
}

/// Final result of [`RequestExecutor::execute`].
#[derive(Clone, Debug, PartialEq)]
pub struct Execution {
    pub outcome: Outcome,
    pub attempts: u32,
}

/// Runs a job against the endpoint with the full retry policy.
///
/// The endpoint is any `tower::Service` answering with a [`RawResponse`];
/// status classification happens here, not in the service. Each sync-mode
/// attempt is wrapped in a [`Timeout`] sized to the job's current attempt
/// budget.
#[derive(Clone, Debug)]
pub struct RequestExecutor<S, L = DefaultRetryLogic> {
    service: S,
    settings: RetrySettings,
    logic: L,
    progress: ProgressSink,
}

impl<S> RequestExecutor<S> {
    pub fn new(service: S, settings: RetrySettings) -> Self {
        Self {
            service,
            settings,
            logic: DefaultRetryLogic,
            progress: ProgressSink::default(),
        }
    }
}

impl<S, L> RequestExecutor<S, L> {
    pub fn with_retry_logic<L2>(self, logic: L2) -> RequestExecutor<S, L2> {
        RequestExecutor {
            service: self.service,
            settings: self.settings,
            logic,
            progress: self.progress,
        }
    }

    pub(crate) fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }
}

impl<S, L> RequestExecutor<S, L>
where
    S: Service<CompressionRequest, Response = RawResponse> + Clone,
    S::Error: Into<crate::Error>,
    L: RetryLogic<Error = HttpError>,
{
    /// Attempts `request` up to `max_retries` times.
    ///
    /// Every rate-limited attempt is reported to `controller` before the
    /// backoff sleep, so concurrent workers shrink without waiting for this
    /// job to finish. Success and terminal-failure accounting is left to
    /// the caller.
    pub async fn execute(&mut self, request: &CompressionRequest, controller: &ConcurrencyController) -> Execution {
        let mut state = RetryState::new(&self.settings, request.config.timeout, self.logic.clone());

        loop {
            let timeout = state.begin_attempt();
            let started = instant_now();
            let error = match self.attempt(request, timeout).await {
                Ok(Compressed { ratio, payload }) => {
                    let latency = started.elapsed();
                    debug!(
                        job_id = %request.job_id,
                        attempt = state.attempts(),
                        latency_ms = latency.as_millis(),
                        ratio,
                        "Compression succeeded"
                    );
                    return Execution {
                        outcome: Outcome::Success { ratio, latency, payload },
                        attempts: state.attempts(),
                    };
                }
                Err(error) => error,
            };

            if error.is_rate_limited() {
                controller.record_rate_limit();
            }

            match state.on_failure(&error) {
                RetryAction::Retry { delay, reason } => {
                    warn!(
                        job_id = %request.job_id,
                        attempt = state.attempts(),
                        retry_in_ms = delay.as_millis(),
                        %reason,
                        "Attempt failed; retrying"
                    );
                    self.progress.emit(ProgressEvent::AttemptFailed {
                        job_id: request.job_id,
                        attempt: state.attempts(),
                        error: error.to_string(),
                        retry_in: Some(delay),
                    });
                    tokio::time::sleep(delay).await;
                }
                RetryAction::DontRetry(reason) => {
                    error!(
                        job_id = %request.job_id,
                        attempts = state.attempts(),
                        %reason,
                        "Job failed"
                    );
                    self.progress.emit(ProgressEvent::AttemptFailed {
                        job_id: request.job_id,
                        attempt: state.attempts(),
                        error: error.to_string(),
                        retry_in: None,
                    });
                    return Execution {
                        outcome: Outcome::from_error(&error),
                        attempts: state.attempts(),
                    };
                }
            }
        }
    }

    async fn attempt(&mut self, request: &CompressionRequest, timeout: Duration) -> Result<Compressed, HttpError> {
        let mut request = request.clone();
        request.timeout = timeout;

        // An async-mode call spans task creation and polling; the service
        // bounds it with its own maximum wait.
        let response = match request.processing_mode() {
            ProcessingMode::Sync => call(Timeout::new(self.service.clone(), timeout), request).await?,
            ProcessingMode::Async => call(self.service.clone(), request).await?,
        };
        classify_response(response)
    }
}

async fn call<T>(mut service: T, request: CompressionRequest) -> Result<RawResponse, HttpError>
where
    T: Service<CompressionRequest, Response = RawResponse>,
    T::Error: Into<crate::Error>,
{
    let ready = ServiceExt::<CompressionRequest>::ready(&mut service)
        .await
        .map_err(|e| HttpError::from_service_error(e.into()))?;
    ready
        .call(request)
        .await
        .map_err(|e| HttpError::from_service_error(e.into()))
}
