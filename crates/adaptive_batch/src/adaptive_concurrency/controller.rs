//! The shared worker-count controller.
//!
//! Two triggers change `current_workers`:
//!
//! * **Immediate**: [`ConcurrencyController::record_rate_limit`] halves the
//!   limit as soon as any worker sees a 429.
//! * **Periodic**: [`ConcurrencyController::adjust_workers`] inspects the
//!   counters gathered since the last firing, at most once per
//!   `adjustment_interval`, and moves the limit by at most one.
//!
//! All state lives behind one mutex, and the permit pool is resized inside
//! the same critical section so the semaphore never disagrees with the
//! recorded limit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::AcquireError;
use tokio::time::Instant;

use super::http::HttpError;
use super::internal_event::{
    RateLimitObservedHandle, RequestLatencyHandle, WorkersAdjustedData, WorkersAdjustedHandle,
};
use super::{ConcurrencyPermit, ConcurrencySettings, ShrinkableSemaphore, instant_now};

/// Capacity information reported by the remote API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApiLimits {
    pub max_workers: Option<usize>,
    pub requests_per_window: Option<u64>,
}

/// Best-effort source of [`ApiLimits`].
pub trait CapacitySource: Send + Sync {
    fn get_limits(&self) -> BoxFuture<'_, Result<ApiLimits, HttpError>>;
}

#[derive(Debug)]
struct ConcurrencyState {
    current_workers: usize,
    min_workers: usize,
    max_workers: usize,
    recommended_workers: usize,

    success_count: u64,
    error_count: u64,
    rate_limit_count: u64,
    total_latency: Duration,

    last_adjustment_time: Instant,
    last_limit_refresh_time: Option<Instant>,
    api_limits: Option<ApiLimits>,

    total_successes: u64,
    total_errors: u64,
    total_rate_limits: u64,
}

impl ConcurrencyState {
    fn error_rate(&self) -> f64 {
        let attempts = self.success_count + self.error_count;
        if attempts == 0 {
            0.0
        } else {
            self.error_count as f64 / attempts as f64
        }
    }

    fn average_latency(&self) -> Duration {
        if self.success_count == 0 {
            Duration::ZERO
        } else {
            self.total_latency.div_f64(self.success_count as f64)
        }
    }

    fn clamp(&self, workers: usize) -> usize {
        workers.clamp(self.min_workers, self.max_workers)
    }

    fn reset_interval_counters(&mut self) {
        self.success_count = 0;
        self.error_count = 0;
        self.total_latency = Duration::ZERO;
    }
}

/// Point-in-time copy of the controller state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConcurrencySnapshot {
    pub current_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub recommended_workers: usize,
    pub success_count: u64,
    pub error_count: u64,
    pub rate_limit_count: u64,
    pub total_latency: Duration,
    pub api_limits: Option<ApiLimits>,
    pub total_successes: u64,
    pub total_errors: u64,
    pub total_rate_limits: u64,
}

pub struct ConcurrencyController {
    state: Mutex<ConcurrencyState>,
    semaphore: Arc<ShrinkableSemaphore>,
    settings: ConcurrencySettings,
    workers_adjusted: WorkersAdjustedHandle,
    rate_limit_observed: RateLimitObservedHandle,
    request_latency: RequestLatencyHandle,
}

impl std::fmt::Debug for ConcurrencyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyController")
            .field("state", &self.snapshot())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ConcurrencyController {
    /// Creates a controller using the caller-supplied initial worker count
    /// for the current, maximum and recommended counts.
    pub fn new(settings: ConcurrencySettings) -> Self {
        let min_workers = settings.min_workers.max(1);
        let initial = settings
            .initial_workers
            .clamp(min_workers, settings.worker_ceiling.max(min_workers));

        let workers_adjusted = WorkersAdjustedHandle::register();
        workers_adjusted.emit(WorkersAdjustedData {
            previous: initial,
            current: initial,
            reason: "initial",
        });

        Self {
            state: Mutex::new(ConcurrencyState {
                current_workers: initial,
                min_workers,
                max_workers: initial,
                recommended_workers: initial,
                success_count: 0,
                error_count: 0,
                rate_limit_count: 0,
                total_latency: Duration::ZERO,
                last_adjustment_time: instant_now(),
                last_limit_refresh_time: None,
                api_limits: None,
                total_successes: 0,
                total_errors: 0,
                total_rate_limits: 0,
            }),
            semaphore: ShrinkableSemaphore::new(initial),
            settings,
            workers_adjusted,
            rate_limit_observed: RateLimitObservedHandle::register(),
            request_latency: RequestLatencyHandle::register(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConcurrencyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves `current_workers` to `target` (clamped) and resizes the permits.
    fn set_workers(&self, state: &mut ConcurrencyState, target: usize, reason: &'static str) {
        let previous = state.current_workers;
        let current = state.clamp(target);
        state.current_workers = current;
        self.semaphore.resize(previous, current);
        self.workers_adjusted.emit(WorkersAdjustedData {
            previous,
            current,
            reason,
        });
    }

    pub fn settings(&self) -> &ConcurrencySettings {
        &self.settings
    }

    pub fn current_workers(&self) -> usize {
        self.lock().current_workers
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        let state = self.lock();
        ConcurrencySnapshot {
            current_workers: state.current_workers,
            min_workers: state.min_workers,
            max_workers: state.max_workers,
            recommended_workers: state.recommended_workers,
            success_count: state.success_count,
            error_count: state.error_count,
            rate_limit_count: state.rate_limit_count,
            total_latency: state.total_latency,
            api_limits: state.api_limits,
            total_successes: state.total_successes,
            total_errors: state.total_errors,
            total_rate_limits: state.total_rate_limits,
        }
    }

    /// Waits for a request permit. The number of permits tracks
    /// `current_workers`.
    pub(crate) async fn acquire(&self) -> Result<ConcurrencyPermit, AcquireError> {
        Arc::clone(&self.semaphore).acquire().await
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn record_success(&self, latency: Duration) {
        self.request_latency.emit(latency);
        let mut state = self.lock();
        state.success_count += 1;
        state.total_successes += 1;
        state.total_latency += latency;
    }

    pub fn record_error(&self) {
        let mut state = self.lock();
        state.error_count += 1;
        state.total_errors += 1;
    }

    /// Records a rate-limit response and halves the limit right away.
    pub fn record_rate_limit(&self) {
        let mut state = self.lock();
        state.rate_limit_count += 1;
        state.total_rate_limits += 1;
        let halved = state.current_workers / 2;
        self.set_workers(&mut state, halved, "rate_limited");
        self.rate_limit_observed.emit(state.current_workers);
    }

    /// Periodic adjustment. Returns the (possibly unchanged) worker limit.
    pub fn adjust_workers(&self) -> usize {
        self.adjust_workers_at(instant_now())
    }

    pub(crate) fn adjust_workers_at(&self, now: Instant) -> usize {
        let mut state = self.lock();
        if now.saturating_duration_since(state.last_adjustment_time)
            < self.settings.adjustment_interval
        {
            return state.current_workers;
        }

        if state.rate_limit_count > 0 {
            // The immediate halving already applied; hold for one cycle.
            state.rate_limit_count = 0;
            let current = state.current_workers;
            self.set_workers(&mut state, current, "rate_limit_cooldown");
        } else {
            let error_rate = state.error_rate();
            let current = state.current_workers;
            if error_rate > self.settings.error_rate_shrink_threshold {
                self.set_workers(&mut state, current.saturating_sub(1), "error_rate");
            } else if state.success_count > self.settings.growth_min_successes
                && state.average_latency() < self.settings.growth_max_latency
                && error_rate < self.settings.growth_max_error_rate
                && current < state.recommended_workers
            {
                self.set_workers(&mut state, current + 1, "healthy");
            } else {
                self.set_workers(&mut state, current, "steady");
            }
        }

        state.reset_interval_counters();
        state.last_adjustment_time = now;
        state.current_workers
    }

    /// Whether capacity discovery is due.
    pub fn should_refresh_limits(&self) -> bool {
        let state = self.lock();
        match state.last_limit_refresh_time {
            None => true,
            Some(at) => at.elapsed() >= self.settings.limit_refresh_interval,
        }
    }

    /// Queries `source` for capacity if the refresh interval allows.
    ///
    /// Never fails: an unreachable source leaves the static defaults in place.
    pub async fn discover_capacity(&self, source: &dyn CapacitySource) -> Option<ApiLimits> {
        if !self.should_refresh_limits() {
            return None;
        }
        let result = source.get_limits().await;
        let mut state = self.lock();
        state.last_limit_refresh_time = Some(instant_now());
        match result {
            Ok(limits) => {
                self.apply_limits(&mut state, limits);
                Some(limits)
            }
            Err(error) => {
                warn!(
                    target: "adaptive_batch::controller",
                    %error,
                    fallback_workers = state.current_workers,
                    "Could not fetch rate limits; using static worker count"
                );
                None
            }
        }
    }

    fn apply_limits(&self, state: &mut ConcurrencyState, limits: ApiLimits) {
        let first = state.api_limits.is_none();
        let discovered = limits
            .max_workers
            .unwrap_or(self.settings.initial_workers)
            .clamp(state.min_workers, self.settings.worker_ceiling.max(state.min_workers));

        state.max_workers = discovered;
        state.recommended_workers = discovered;
        state.api_limits = Some(limits);

        let target = if first {
            // Start conservatively at half the advertised capacity.
            (discovered / 2).max(1)
        } else {
            state.current_workers
        };
        info!(
            target: "adaptive_batch::controller",
            max_workers = discovered,
            requests_per_window = ?limits.requests_per_window,
            "Discovered API capacity"
        );
        self.set_workers(state, target, "capacity_discovery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    fn controller(initial: usize) -> ConcurrencyController {
        ConcurrencyController::new(ConcurrencySettings::builder().initial_workers(initial).build())
    }

    struct FixedLimits(Result<ApiLimits, ()>);

    impl CapacitySource for FixedLimits {
        fn get_limits(&self) -> BoxFuture<'_, Result<ApiLimits, HttpError>> {
            let result = self.0.map_err(|_| HttpError::Timeout);
            Box::pin(async move { result })
        }
    }

    async fn discovered(max: usize) -> ConcurrencyController {
        let controller = controller(4);
        let source = FixedLimits(Ok(ApiLimits {
            max_workers: Some(max),
            requests_per_window: Some(600),
        }));
        controller.discover_capacity(&source).await;
        controller
    }

    fn assert_clamped(c: &ConcurrencyController) {
        let s = c.snapshot();
        assert!(
            s.min_workers <= s.current_workers && s.current_workers <= s.max_workers,
            "clamp violated: {:?}",
            s
        );
    }

    #[test]
    fn rate_limit_halves_immediately() {
        let c = controller(8);
        c.record_rate_limit();
        assert_eq!(c.current_workers(), 4);
        c.record_rate_limit();
        assert_eq!(c.current_workers(), 2);
        c.record_rate_limit();
        c.record_rate_limit();
        assert_eq!(c.current_workers(), 1);
        assert_eq!(c.snapshot().rate_limit_count, 4);
    }

    #[test]
    fn halving_shrinks_available_permits() {
        let c = controller(8);
        assert_eq!(c.available_permits(), 8);
        c.record_rate_limit();
        assert_eq!(c.available_permits(), 4);
    }

    #[tokio::test]
    async fn adjust_is_noop_inside_interval() {
        time::pause();
        let c = discovered(10).await;
        for _ in 0..60 {
            c.record_success(Duration::from_millis(100));
        }
        time::advance(Duration::from_secs(29)).await;
        assert_eq!(c.adjust_workers(), 5);
        assert_eq!(c.snapshot().success_count, 60);
    }

    #[tokio::test]
    async fn growth_requires_more_than_fifty_successes() {
        time::pause();
        let c = discovered(10).await;
        assert_eq!(c.current_workers(), 5);

        for _ in 0..49 {
            c.record_success(Duration::from_millis(200));
        }
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(c.adjust_workers(), 5);

        for _ in 0..51 {
            c.record_success(Duration::from_millis(200));
        }
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(c.adjust_workers(), 6);
        assert_eq!(c.snapshot().success_count, 0);
        assert_eq!(c.snapshot().total_latency, Duration::ZERO);
    }

    #[tokio::test]
    async fn growth_is_capped_by_recommendation() {
        time::pause();
        let c = controller(3);
        for _ in 0..100 {
            c.record_success(Duration::from_millis(10));
        }
        time::advance(Duration::from_secs(31)).await;
        // Without discovery the recommendation equals the initial count.
        assert_eq!(c.adjust_workers(), 3);
    }

    #[tokio::test]
    async fn slow_responses_block_growth() {
        time::pause();
        let c = discovered(10).await;
        for _ in 0..80 {
            c.record_success(Duration::from_secs(3));
        }
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(c.adjust_workers(), 5);
    }

    #[tokio::test]
    async fn high_error_rate_removes_one_worker() {
        time::pause();
        let c = discovered(10).await;
        for _ in 0..90 {
            c.record_success(Duration::from_millis(100));
        }
        for _ in 0..11 {
            c.record_error();
        }
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(c.adjust_workers(), 4);
        let s = c.snapshot();
        assert_eq!((s.success_count, s.error_count), (0, 0));
        assert_eq!(s.total_errors, 11);
    }

    #[tokio::test]
    async fn cooldown_after_rate_limit() {
        time::pause();
        let c = discovered(10).await;
        c.record_rate_limit();
        assert_eq!(c.current_workers(), 2);
        for _ in 0..100 {
            c.record_success(Duration::from_millis(50));
        }
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(c.adjust_workers(), 2);
        let s = c.snapshot();
        assert_eq!(s.rate_limit_count, 0);
        assert_eq!(s.total_rate_limits, 1);

        // The next quiet cycle may grow again.
        for _ in 0..100 {
            c.record_success(Duration::from_millis(50));
        }
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(c.adjust_workers(), 3);
    }

    #[tokio::test]
    async fn second_adjust_in_same_window_changes_nothing() {
        time::pause();
        let c = discovered(10).await;
        for _ in 0..60 {
            c.record_success(Duration::from_millis(100));
        }
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(c.adjust_workers(), 6);
        let before = c.snapshot();

        c.record_error();
        let after_error = c.snapshot();
        assert_eq!(c.adjust_workers(), 6);
        assert_eq!(c.snapshot(), after_error);
        assert_eq!(before.current_workers, after_error.current_workers);
    }

    #[tokio::test]
    async fn clamp_holds_for_mixed_sequences() {
        time::pause();
        let c = discovered(6).await;
        for round in 0..40u64 {
            match round % 4 {
                0 => c.record_rate_limit(),
                1 => {
                    for _ in 0..60 {
                        c.record_success(Duration::from_millis(5));
                    }
                }
                2 => {
                    for _ in 0..round {
                        c.record_error();
                    }
                }
                _ => {}
            }
            assert_clamped(&c);
            time::advance(Duration::from_secs(17)).await;
            c.adjust_workers();
            assert_clamped(&c);
        }
    }

    #[tokio::test]
    async fn error_shrink_never_goes_below_minimum() {
        time::pause();
        let c = controller(1);
        for _ in 0..10 {
            c.record_error();
        }
        time::advance(Duration::from_secs(31)).await;
        assert_eq!(c.adjust_workers(), 1);
    }

    #[tokio::test]
    async fn discovery_starts_at_half_of_max() {
        let c = discovered(9).await;
        let s = c.snapshot();
        assert_eq!(s.max_workers, 9);
        assert_eq!(s.recommended_workers, 9);
        assert_eq!(s.current_workers, 4);
        assert_eq!(c.available_permits(), 4);
    }

    #[tokio::test]
    async fn discovery_of_single_worker_floors_at_one() {
        let c = discovered(1).await;
        assert_eq!(c.current_workers(), 1);
    }

    #[tokio::test]
    async fn discovery_is_clamped_to_ceiling() {
        let c = ConcurrencyController::new(
            ConcurrencySettings::builder().initial_workers(4).worker_ceiling(16).build(),
        );
        let source = FixedLimits(Ok(ApiLimits {
            max_workers: Some(1000),
            requests_per_window: None,
        }));
        c.discover_capacity(&source).await;
        assert_eq!(c.snapshot().max_workers, 16);
        assert_eq!(c.current_workers(), 8);
    }

    #[tokio::test]
    async fn failed_discovery_keeps_initial_count() {
        let c = controller(6);
        assert!(c.discover_capacity(&FixedLimits(Err(()))).await.is_none());
        let s = c.snapshot();
        assert_eq!((s.current_workers, s.max_workers, s.recommended_workers), (6, 6, 6));
        assert!(s.api_limits.is_none());
    }

    #[tokio::test]
    async fn discovery_respects_refresh_interval() {
        time::pause();
        let c = discovered(10).await;
        let source = FixedLimits(Ok(ApiLimits {
            max_workers: Some(4),
            requests_per_window: None,
        }));
        assert!(c.discover_capacity(&source).await.is_none());
        assert_eq!(c.snapshot().max_workers, 10);

        time::advance(Duration::from_secs(301)).await;
        assert!(c.discover_capacity(&source).await.is_some());
        let s = c.snapshot();
        assert_eq!(s.max_workers, 4);
        // A refresh clamps rather than re-halving.
        assert_eq!(s.current_workers, 4);
    }
}
