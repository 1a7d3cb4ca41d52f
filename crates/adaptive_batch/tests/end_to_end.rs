use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use adaptive_batch::adaptive_concurrency::http::HttpError;
use adaptive_batch::adaptive_concurrency::retries::{JitterMode, RetrySettings};
use adaptive_batch::{
    ApiLimits, BatchError, BatchOrchestrator, BatchSettings, CacheError, CacheKey, CachedResult, CapacitySource,
    CompressionRequest, ConcurrencySettings, FailureRecord, Job, JobId, MemoryCache, Outcome, ProgressEvent,
    RawResponse, RequestFingerprint, ResultCache,
};
use futures::future::BoxFuture;
use tower::Service;

/// Endpoint stub: per-job scripted rate limits, optional latency, and
/// bookkeeping of calls and concurrency.
#[derive(Clone, Default)]
struct Endpoint {
    rate_limit_first: Arc<HashMap<JobId, u32>>,
    latency: Duration,
    calls: Arc<Mutex<HashMap<JobId, u32>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl Endpoint {
    fn with_rate_limits(mut self, job: u64, times: u32) -> Self {
        Arc::make_mut(&mut self.rate_limit_first).insert(JobId(job), times);
        self
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn calls(&self, job: u64) -> u32 {
        self.calls.lock().unwrap().get(&JobId(job)).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

impl Service<CompressionRequest> for Endpoint {
    type Response = RawResponse;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<RawResponse, HttpError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: CompressionRequest) -> Self::Future {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(request.job_id).or_insert(0);
            *count += 1;
            *count
        };
        let throttled = attempt <= self.rate_limit_first.get(&request.job_id).copied().unwrap_or(0);
        let latency = self.latency;
        let in_flight = Arc::clone(&self.in_flight);
        let peak = Arc::clone(&self.peak_in_flight);

        Box::pin(async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(latency).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);

            if throttled {
                Ok(RawResponse::too_many_requests())
            } else {
                Ok(RawResponse::ok(
                    r#"{"response":{"segments":[{"compression_ratio":0.3},{"compression_ratio":0.5}]}}"#,
                ))
            }
        })
    }
}

struct FixedLimits(usize);

impl CapacitySource for FixedLimits {
    fn get_limits(&self) -> BoxFuture<'_, Result<ApiLimits, HttpError>> {
        let limits = ApiLimits {
            max_workers: Some(self.0),
            requests_per_window: Some(600),
        };
        Box::pin(async move { Ok(limits) })
    }
}

/// Cache whose lookup of one job panics, taking its worker down.
#[derive(Default)]
struct PanickingCache {
    inner: MemoryCache,
    poisoned: u64,
}

impl ResultCache for PanickingCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, CacheError> {
        if key.job_id == JobId(self.poisoned) {
            panic!("cache lookup exploded for job {}", key.job_id);
        }
        self.inner.get(key)
    }

    fn put(&self, key: &CacheKey, result: &CachedResult) -> Result<(), CacheError> {
        self.inner.put(key, result)
    }

    fn record_failure(&self, key: &CacheKey, failure: &FailureRecord) -> Result<(), CacheError> {
        self.inner.record_failure(key, failure)
    }
}

fn settings(workers: usize) -> BatchSettings {
    BatchSettings::builder()
        .concurrency(ConcurrencySettings::builder().initial_workers(workers).build())
        .retry(RetrySettings::builder().max_retries(3).jitter(JitterMode::None).build())
        .build()
}

fn jobs(count: u64) -> Vec<Job> {
    (1..=count).map(|id| Job::new(id, format!("sample text number {}", id))).collect()
}

#[tokio::test(start_paused = true)]
async fn rate_limited_job_recovers_on_third_attempt() {
    let endpoint = Endpoint::default().with_rate_limits(3, 2);
    let orchestrator = BatchOrchestrator::new(endpoint.clone(), Arc::new(MemoryCache::new()), settings(4));

    let report = orchestrator.run(jobs(10)).await.unwrap();

    assert_eq!(report.total(), 10);
    assert_eq!(report.succeeded(), 10);
    assert!(report.jobs.iter().all(|r| matches!(r.outcome, Outcome::Success { .. })));
    assert_eq!(report.get(JobId(3)).unwrap().attempts, 3);
    assert_eq!(endpoint.calls(3), 3);
    assert_eq!(report.controller.total_rate_limits, 2);
    assert!((report.average_ratio().unwrap() - 0.4).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn every_job_is_processed_exactly_once() {
    let endpoint = Endpoint::default().with_latency(Duration::from_millis(250));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let orchestrator =
        BatchOrchestrator::new(endpoint.clone(), Arc::new(MemoryCache::new()), settings(4)).with_progress(tx);

    let report = orchestrator.run(jobs(37)).await.unwrap();

    assert_eq!(report.total(), 37);
    assert_eq!(report.workers_launched, 4);
    let ids: Vec<u64> = report.jobs.iter().map(|r| r.job_id.0).collect();
    assert_eq!(ids, (1..=37).collect::<Vec<_>>());
    assert_eq!(endpoint.total_calls(), 37);
    assert!((1..=37).all(|id| endpoint.calls(id) == 1));

    let mut exited = Vec::new();
    let mut finished = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            ProgressEvent::WorkerExited { worker } => exited.push(worker),
            ProgressEvent::JobFinished { .. } => finished += 1,
            _ => {}
        }
    }
    exited.sort_unstable();
    assert_eq!(exited, vec![0, 1, 2, 3]);
    assert_eq!(finished, 37);
}

#[tokio::test(start_paused = true)]
async fn in_flight_requests_never_exceed_the_limit() {
    let endpoint = Endpoint::default().with_latency(Duration::from_millis(100));
    let orchestrator = BatchOrchestrator::new(endpoint.clone(), Arc::new(MemoryCache::new()), settings(3));

    orchestrator.run(jobs(20)).await.unwrap();

    assert_eq!(endpoint.peak_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_shrinks_offered_concurrency() {
    let endpoint = Endpoint::default()
        .with_latency(Duration::from_millis(100))
        .with_rate_limits(1, 1);
    let orchestrator = BatchOrchestrator::new(endpoint.clone(), Arc::new(MemoryCache::new()), settings(8));

    let report = orchestrator.run(jobs(40)).await.unwrap();

    assert_eq!(report.succeeded(), 40);
    assert_eq!(report.controller.current_workers, 4);
    assert_eq!(report.workers_launched, 8);
}

#[tokio::test(start_paused = true)]
async fn cached_results_skip_the_endpoint() {
    let endpoint = Endpoint::default();
    let cache = Arc::new(MemoryCache::new());
    let batch_settings = settings(2);

    let cached_job = Job::new(2, "sample text number 2");
    let key = CacheKey {
        job_id: cached_job.id,
        fingerprint: RequestFingerprint::compute(&cached_job.text, &cached_job.resolve(batch_settings.defaults())),
    };
    cache
        .put(
            &key,
            &CachedResult {
                ratio: 0.9,
                payload: serde_json::json!({"cached": true}),
                latency: Duration::from_secs(1),
            },
        )
        .unwrap();

    let orchestrator = BatchOrchestrator::new(endpoint.clone(), cache.clone(), batch_settings);
    let report = orchestrator.run(jobs(3)).await.unwrap();

    let hit = report.get(JobId(2)).unwrap();
    assert_eq!(hit.attempts, 0);
    assert!(matches!(hit.outcome, Outcome::CacheHit { ratio, .. } if ratio == 0.9));
    assert_eq!(endpoint.calls(2), 0);
    assert_eq!(report.cache_hits(), 1);
    assert_eq!(report.controller.total_successes, 2);

    // Successful results were written back, so a rerun is served entirely from cache.
    let rerun = orchestrator.run(jobs(3)).await.unwrap();
    assert_eq!(rerun.cache_hits(), 3);
    assert_eq!(endpoint.total_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn disabled_cache_always_calls_the_endpoint() {
    let endpoint = Endpoint::default();
    let cache = Arc::new(MemoryCache::new());
    let batch_settings = BatchSettings::builder().use_cache(false).build();
    let orchestrator = BatchOrchestrator::new(endpoint.clone(), cache.clone(), batch_settings);

    orchestrator.run(jobs(3)).await.unwrap();
    orchestrator.run(jobs(3)).await.unwrap();

    assert_eq!(endpoint.total_calls(), 6);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_rate_limits_are_recorded_as_failures() {
    let endpoint = Endpoint::default().with_rate_limits(1, 5);
    let cache = Arc::new(MemoryCache::new());
    let orchestrator = BatchOrchestrator::new(endpoint.clone(), cache.clone(), settings(2));

    let report = orchestrator.run(jobs(2)).await.unwrap();

    assert_eq!(report.get(JobId(1)).unwrap().outcome, Outcome::RateLimited);
    assert_eq!(report.get(JobId(1)).unwrap().attempts, 3);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.controller.total_errors, 1);

    let failures = cache.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.job_id, JobId(1));
    assert_eq!(failures[0].1.attempts, 3);
    assert!(cache.get(&failures[0].0).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn discovered_capacity_sets_the_worker_count() {
    let endpoint = Endpoint::default();
    let orchestrator = BatchOrchestrator::new(endpoint, Arc::new(MemoryCache::new()), settings(2))
        .with_capacity_source(Arc::new(FixedLimits(10)));

    let report = orchestrator.run(jobs(12)).await.unwrap();

    assert_eq!(report.workers_launched, 5);
    assert_eq!(report.controller.max_workers, 10);
    assert_eq!(report.succeeded(), 12);
}

#[tokio::test(start_paused = true)]
async fn worker_panic_is_reported_after_every_worker_exits() {
    let endpoint = Endpoint::default().with_latency(Duration::from_millis(50));
    let cache = Arc::new(PanickingCache {
        poisoned: 1,
        ..Default::default()
    });
    let orchestrator = BatchOrchestrator::new(endpoint.clone(), cache, settings(4));

    let err = orchestrator.run(jobs(40)).await.unwrap_err();
    assert!(matches!(err, BatchError::WorkerPanicked { .. }), "{}", err);

    // The surviving workers drained the queue before `run` returned.
    let calls_at_return = endpoint.total_calls();
    assert_eq!(calls_at_return, 39);
    assert_eq!(endpoint.calls(1), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(endpoint.total_calls(), calls_at_return);
}
