//! Decide how many compression requests may be in flight at once.

pub mod controller;
pub mod http;
pub mod internal_event;
pub mod retries;
mod semaphore;

use std::time::Duration;

use bon::Builder;

pub(crate) use semaphore::{ConcurrencyPermit, ShrinkableSemaphore};

pub(crate) fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// Configuration of the worker-count controller.
///
/// The defaults mirror the behaviour the compression API was tuned against:
/// a 30 second decision interval, growth only after more than 50 clean
/// successes, and shrinking once more than 10% of requests fail.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `initial_workers` | 4 | Worker count used when capacity discovery is unavailable |
/// | `min_workers` | 1 | Floor for every decrease |
/// | `worker_ceiling` | 200 | Hard cap applied to any discovered maximum |
/// | `adjustment_interval` | 30s | Minimum wall-clock time between periodic adjustments |
/// | `limit_refresh_interval` | 300s | Minimum time between capacity discovery queries |
/// | `error_rate_shrink_threshold` | 0.10 | Error rate above which one worker is removed |
/// | `growth_min_successes` | 50 | Successes that must be *exceeded* before growing |
/// | `growth_max_latency` | 2s | Average latency must be below this to grow |
/// | `growth_max_error_rate` | 0.02 | Error rate must be below this to grow |
///
/// # Example
///
/// ```rust
/// use adaptive_batch::adaptive_concurrency::ConcurrencySettings;
/// use std::time::Duration;
///
/// let settings = ConcurrencySettings::builder()
///     .initial_workers(8)
///     .adjustment_interval(Duration::from_secs(10))
///     .build();
/// assert_eq!(settings.initial_workers(), 8);
/// assert_eq!(settings.min_workers(), 1);
/// ```
#[derive(Clone, Copy, Debug, Builder)]
pub struct ConcurrencySettings {
    /// Caller-supplied starting worker count. Also used for the maximum and
    /// recommended counts when no capacity information is available.
    #[builder(default = default_initial_workers())]
    pub(crate) initial_workers: usize,

    #[builder(default = default_min_workers())]
    pub(crate) min_workers: usize,

    /// Upper bound for anything the remote API recommends.
    #[builder(default = default_worker_ceiling())]
    pub(crate) worker_ceiling: usize,

    #[builder(default = default_adjustment_interval())]
    pub(crate) adjustment_interval: Duration,

    #[builder(default = default_limit_refresh_interval())]
    pub(crate) limit_refresh_interval: Duration,

    #[builder(default = default_error_rate_shrink_threshold())]
    pub(crate) error_rate_shrink_threshold: f64,

    #[builder(default = default_growth_min_successes())]
    pub(crate) growth_min_successes: u64,

    #[builder(default = default_growth_max_latency())]
    pub(crate) growth_max_latency: Duration,

    #[builder(default = default_growth_max_error_rate())]
    pub(crate) growth_max_error_rate: f64,
}

const fn default_initial_workers() -> usize {
    4
}

const fn default_min_workers() -> usize {
    1
}

const fn default_worker_ceiling() -> usize {
    200
}

const fn default_adjustment_interval() -> Duration {
    Duration::from_secs(30)
}

/// Capacity discovery is advisory, so it is refreshed rarely (5 minutes).
const fn default_limit_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

const fn default_error_rate_shrink_threshold() -> f64 {
    0.10
}

const fn default_growth_min_successes() -> u64 {
    50
}

const fn default_growth_max_latency() -> Duration {
    Duration::from_secs(2)
}

const fn default_growth_max_error_rate() -> f64 {
    0.02
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            initial_workers: default_initial_workers(),
            min_workers: default_min_workers(),
            worker_ceiling: default_worker_ceiling(),
            adjustment_interval: default_adjustment_interval(),
            limit_refresh_interval: default_limit_refresh_interval(),
            error_rate_shrink_threshold: default_error_rate_shrink_threshold(),
            growth_min_successes: default_growth_min_successes(),
            growth_max_latency: default_growth_max_latency(),
            growth_max_error_rate: default_growth_max_error_rate(),
        }
    }
}

impl ConcurrencySettings {
    pub fn initial_workers(&self) -> usize {
        self.initial_workers
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn worker_ceiling(&self) -> usize {
        self.worker_ceiling
    }

    pub fn adjustment_interval(&self) -> Duration {
        self.adjustment_interval
    }

    pub fn limit_refresh_interval(&self) -> Duration {
        self.limit_refresh_interval
    }
}
