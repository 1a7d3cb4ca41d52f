//! Fixed set of worker tasks draining the shared queue.
//!
//! The task count is read once from the controller when the pool starts.
//! Later adjustments change how many permits exist, not how many tasks run.

use std::sync::Arc;

use futures::future::join_all;
use snafu::ResultExt;
use tower::Service;

use super::cache::{CacheKey, CachedResult, FailureRecord, ResultCache};
use super::events::{ProgressEvent, ProgressSink};
use super::executor::{CompressionRequest, Execution, RequestExecutor};
use super::orchestrator::{BatchError, PermitsClosedSnafu, WorkerPanickedSnafu};
use super::outcome::{JobReport, Outcome};
use super::queue::{PreparedJob, QueueItem, WorkQueue};
use crate::adaptive_concurrency::controller::ConcurrencyController;
use crate::adaptive_concurrency::http::{HttpError, RawResponse};
use crate::adaptive_concurrency::internal_event::JobFinishedHandle;
use crate::adaptive_concurrency::retries::RetryLogic;

struct WorkerContext {
    queue: WorkQueue,
    controller: Arc<ConcurrencyController>,
    cache: Arc<dyn ResultCache>,
    use_cache: bool,
    progress: ProgressSink,
    job_finished: JobFinishedHandle,
}

pub(crate) struct PoolRun {
    pub(crate) workers: usize,
    pub(crate) reports: Vec<JobReport>,
}

pub(crate) struct WorkerPool<S, L> {
    executor: RequestExecutor<S, L>,
    controller: Arc<ConcurrencyController>,
    cache: Arc<dyn ResultCache>,
    use_cache: bool,
    progress: ProgressSink,
}

impl<S, L> WorkerPool<S, L>
where
    S: Service<CompressionRequest, Response = RawResponse> + Clone + Send + 'static,
    S::Error: Into<crate::Error>,
    S::Future: Send,
    L: RetryLogic<Error = HttpError>,
{
    pub(crate) fn new(
        executor: RequestExecutor<S, L>,
        controller: Arc<ConcurrencyController>,
        cache: Arc<dyn ResultCache>,
        use_cache: bool,
        progress: ProgressSink,
    ) -> Self {
        Self {
            executor,
            controller,
            cache,
            use_cache,
            progress,
        }
    }

    /// Runs every job to a terminal outcome and waits for all workers to
    /// exit.
    pub(crate) async fn run(self, jobs: Vec<PreparedJob>) -> Result<PoolRun, BatchError> {
        let workers = self.controller.current_workers();
        let total = jobs.len();
        self.progress.emit(ProgressEvent::BatchStarted { jobs: total, workers });
        info!(jobs = total, workers, "Starting worker pool");

        let context = Arc::new(WorkerContext {
            queue: WorkQueue::seeded(jobs, workers),
            controller: self.controller,
            cache: self.cache,
            use_cache: self.use_cache,
            progress: self.progress.clone(),
            job_finished: JobFinishedHandle::register(),
        });

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let executor = self.executor.clone().with_progress(self.progress.clone());
                tokio::spawn(run_worker(worker, Arc::clone(&context), executor))
            })
            .collect();

        // Every worker is joined before any error surfaces, so no task
        // outlives the run.
        let mut reports = Vec::with_capacity(total);
        let mut first_error = None;
        for joined in join_all(handles).await {
            match joined.context(WorkerPanickedSnafu).and_then(|worker| worker) {
                Ok(worker_reports) => reports.extend(worker_reports),
                Err(error) => {
                    error!(%error, "Worker ended abnormally");
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(PoolRun { workers, reports }),
        }
    }
}

async fn run_worker<S, L>(
    worker: usize,
    context: Arc<WorkerContext>,
    mut executor: RequestExecutor<S, L>,
) -> Result<Vec<JobReport>, BatchError>
where
    S: Service<CompressionRequest, Response = RawResponse> + Clone,
    S::Error: Into<crate::Error>,
    L: RetryLogic<Error = HttpError>,
{
    let mut reports = Vec::new();
    loop {
        let job = match context.queue.pop().await {
            QueueItem::Job(job) => job,
            QueueItem::Stop => break,
        };

        let permit = context.controller.acquire().await.context(PermitsClosedSnafu)?;
        context.progress.emit(ProgressEvent::JobStarted {
            job_id: job.request.job_id,
            worker,
        });
        let report = process(&context, &mut executor, job).await;
        drop(permit);

        context.controller.adjust_workers();
        context.job_finished.emit(&report.outcome);
        context.progress.emit(ProgressEvent::JobFinished {
            worker,
            report: report.clone(),
        });
        reports.push(report);
    }

    debug!(worker, processed = reports.len(), "Worker exiting");
    context.progress.emit(ProgressEvent::WorkerExited { worker });
    Ok(reports)
}

async fn process<S, L>(context: &WorkerContext, executor: &mut RequestExecutor<S, L>, job: PreparedJob) -> JobReport
where
    S: Service<CompressionRequest, Response = RawResponse> + Clone,
    S::Error: Into<crate::Error>,
    L: RetryLogic<Error = HttpError>,
{
    let key = CacheKey {
        job_id: job.request.job_id,
        fingerprint: job.fingerprint,
    };

    if context.use_cache {
        match context.cache.get(&key) {
            Ok(Some(hit)) => {
                debug!(job_id = %key.job_id, fingerprint = %key.fingerprint, "Cache hit");
                return JobReport {
                    job_id: key.job_id,
                    fingerprint: key.fingerprint,
                    outcome: Outcome::CacheHit {
                        ratio: hit.ratio,
                        payload: hit.payload,
                    },
                    attempts: 0,
                };
            }
            Ok(None) => {}
            Err(error) => warn!(job_id = %key.job_id, %error, "Cache lookup failed; treating as a miss"),
        }
    }

    let Execution { outcome, attempts } = executor.execute(&job.request, &context.controller).await;

    match &outcome {
        Outcome::Success { ratio, latency, payload } => {
            context.controller.record_success(*latency);
            if context.use_cache {
                let result = CachedResult {
                    ratio: *ratio,
                    payload: payload.clone(),
                    latency: *latency,
                };
                if let Err(error) = context.cache.put(&key, &result) {
                    warn!(job_id = %key.job_id, %error, "Failed to cache result");
                }
            }
        }
        failed => {
            context.controller.record_error();
            if context.use_cache {
                let record = FailureRecord {
                    kind: match failed {
                        Outcome::Error { kind, .. } => Some(*kind),
                        _ => None,
                    },
                    message: failed.failure_message().unwrap_or_default(),
                    attempts,
                };
                if let Err(error) = context.cache.record_failure(&key, &record) {
                    warn!(job_id = %key.job_id, %error, "Failed to record job failure");
                }
            }
        }
    }

    JobReport {
        job_id: key.job_id,
        fingerprint: key.fingerprint,
        outcome,
        attempts,
    }
}
