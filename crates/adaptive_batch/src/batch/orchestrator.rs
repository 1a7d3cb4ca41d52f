use std::collections::HashSet;
use std::sync::Arc;

use snafu::Snafu;
use tokio::sync::mpsc::UnboundedSender;
use tower::Service;

use super::BatchSettings;
use super::cache::ResultCache;
use super::events::{ProgressEvent, ProgressSink};
use super::executor::{CompressionRequest, RequestExecutor};
use super::fingerprint::RequestFingerprint;
use super::job::{Job, JobId};
use super::pool::WorkerPool;
use super::queue::PreparedJob;
use super::report::BatchReport;
use crate::adaptive_concurrency::controller::{CapacitySource, ConcurrencyController};
use crate::adaptive_concurrency::http::{HttpError, RawResponse};
use crate::adaptive_concurrency::instant_now;
use crate::adaptive_concurrency::retries::{DefaultRetryLogic, RetryLogic};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BatchError {
    #[snafu(display("Job id {} appears more than once in the batch", job_id))]
    DuplicateJobId { job_id: JobId },

    #[snafu(display("A worker task panicked: {}", source))]
    WorkerPanicked { source: tokio::task::JoinError },

    /// Surfaces `ShrinkableSemaphore::acquire` failing. The controller never
    /// closes its permit pool, so a live batch does not produce this.
    #[snafu(display("The concurrency permit pool was closed: {}", source))]
    PermitsClosed { source: tokio::sync::AcquireError },
}

/// Entry point: turns a list of jobs into a [`BatchReport`].
///
/// The orchestrator owns its [`ConcurrencyController`], so limits learned
/// in one batch carry over to the next one run through the same instance.
pub struct BatchOrchestrator<S, L = DefaultRetryLogic> {
    executor: RequestExecutor<S, L>,
    cache: Arc<dyn ResultCache>,
    controller: Arc<ConcurrencyController>,
    capacity: Option<Arc<dyn CapacitySource>>,
    settings: BatchSettings,
    progress: ProgressSink,
}

impl<S> BatchOrchestrator<S> {
    pub fn new(service: S, cache: Arc<dyn ResultCache>, settings: BatchSettings) -> Self {
        Self {
            executor: RequestExecutor::new(service, settings.retry),
            cache,
            controller: Arc::new(ConcurrencyController::new(settings.concurrency)),
            capacity: None,
            settings,
            progress: ProgressSink::default(),
        }
    }
}

impl<S, L> BatchOrchestrator<S, L> {
    /// Enables best-effort capacity discovery before each batch.
    pub fn with_capacity_source(mut self, source: Arc<dyn CapacitySource>) -> Self {
        self.capacity = Some(source);
        self
    }

    pub fn with_progress(mut self, sender: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = ProgressSink::new(sender);
        self
    }

    pub fn with_retry_logic<L2>(self, logic: L2) -> BatchOrchestrator<S, L2> {
        BatchOrchestrator {
            executor: self.executor.with_retry_logic(logic),
            cache: self.cache,
            controller: self.controller,
            capacity: self.capacity,
            settings: self.settings,
            progress: self.progress,
        }
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.controller
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }
}

impl<S, L> BatchOrchestrator<S, L>
where
    S: Service<CompressionRequest, Response = RawResponse> + Clone + Send + 'static,
    S::Error: Into<crate::Error>,
    S::Future: Send,
    L: RetryLogic<Error = HttpError>,
{
    /// Runs every job to exactly one outcome.
    ///
    /// Job ids must be unique within the batch. Reports come back ordered by
    /// job id, whatever order the workers finished in.
    pub async fn run(&self, jobs: impl IntoIterator<Item = Job>) -> Result<BatchReport, BatchError> {
        let started = instant_now();
        let prepared = self.prepare(jobs)?;

        if let Some(source) = &self.capacity {
            self.controller.discover_capacity(source.as_ref()).await;
        }

        let pool = WorkerPool::new(
            self.executor.clone(),
            Arc::clone(&self.controller),
            Arc::clone(&self.cache),
            self.settings.use_cache,
            self.progress.clone(),
        );
        let run = pool.run(prepared).await?;

        let mut reports = run.reports;
        reports.sort_by_key(|report| report.job_id);
        let report = BatchReport::new(reports, run.workers, self.controller.snapshot(), started.elapsed());

        self.progress.emit(ProgressEvent::BatchFinished {
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        info!(
            total = report.total(),
            succeeded = report.succeeded(),
            cache_hits = report.cache_hits(),
            failed = report.failed(),
            final_workers = report.controller.current_workers,
            "Batch finished"
        );
        Ok(report)
    }

    fn prepare(&self, jobs: impl IntoIterator<Item = Job>) -> Result<Vec<PreparedJob>, BatchError> {
        let mut seen = HashSet::new();
        jobs.into_iter()
            .map(|job| {
                if !seen.insert(job.id) {
                    return DuplicateJobIdSnafu { job_id: job.id }.fail();
                }
                let config = job.resolve(&self.settings.defaults);
                let fingerprint = RequestFingerprint::compute(&job.text, &config);
                Ok(PreparedJob {
                    fingerprint,
                    request: CompressionRequest::new(job.id, job.text, config),
                })
            })
            .collect()
    }
}
