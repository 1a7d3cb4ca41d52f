use std::{borrow::Cow, time::Duration};

use bon::Builder;

use super::http::{HttpError, grow_timeout};

/// What to do after a failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryAction {
    /// Sleep for `delay`, then try again.
    Retry {
        delay: Duration,
        reason: Cow<'static, str>,
    },
    /// Give up; the failure becomes the job's final outcome.
    DontRetry(Cow<'static, str>),
}

impl RetryAction {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, RetryAction::Retry { .. })
    }

    pub const fn is_not_retryable(&self) -> bool {
        matches!(self, RetryAction::DontRetry(_))
    }
}

/// Defines the contract for determining which failures should be retried.
///
/// # Example
/// ```rust
/// use adaptive_batch::adaptive_concurrency::http::HttpError;
/// use adaptive_batch::adaptive_concurrency::retries::RetryLogic;
///
/// #[derive(Clone)]
/// struct NoServerRetries;
///
/// impl RetryLogic for NoServerRetries {
///     type Error = HttpError;
///
///     fn is_retriable_error(&self, error: &Self::Error) -> bool {
///         matches!(error, HttpError::Timeout | HttpError::RateLimited { .. })
///     }
/// }
/// ```
pub trait RetryLogic: Clone + Send + Sync + 'static {
    /// The type of errors produced by the endpoint
    type Error: std::error::Error + Send + Sync + 'static;

    /// Determines if an error should trigger a retry.
    fn is_retriable_error(&self, error: &Self::Error) -> bool;
}

/// Retries timeouts, rate limits, transport failures and server errors.
///
/// A malformed 2xx body is never retried: sending the same request again
/// will return the same structurally wrong answer.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRetryLogic;

impl RetryLogic for DefaultRetryLogic {
    type Error = HttpError;

    fn is_retriable_error(&self, error: &Self::Error) -> bool {
        match error {
            HttpError::Timeout
            | HttpError::RateLimited { .. }
            | HttpError::Transport { .. }
            | HttpError::ServerError { .. } => true,
            HttpError::MalformedResponse { .. } | HttpError::InvalidRequest { .. } => false,
        }
    }
}

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum JitterMode {
    /// No jitter.
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay calculated by the backoff
    /// strategy.
    Full,

    /// Proportional jitter.
    ///
    /// The delay is stretched by a random factor in `[1, 1 + fraction)`, so
    /// it never drops below the computed backoff.
    Proportional { fraction: f64 },
}

impl Default for JitterMode {
    fn default() -> Self {
        JitterMode::Proportional { fraction: 0.2 }
    }
}

impl JitterMode {
    pub fn apply(&self, base: Duration) -> Duration {
        match *self {
            JitterMode::None => base,
            JitterMode::Full => {
                if base.is_zero() {
                    return base;
                }
                base.mul_f64(rand::random::<f64>())
            }
            JitterMode::Proportional { fraction } => {
                base.mul_f64(1.0 + rand::random::<f64>() * fraction.max(0.0))
            }
        }
    }
}

// `tokio-retry` crate
// MIT License
// Copyright (c) 2017 Sam Rijs
//
/// A retry strategy driven by exponential back-off.
///
/// The power corresponds to the number of past attempts: the first delay is
/// `base^0 * factor`, the second `base^1 * factor`, and so on.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: Duration,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn new(base: u64, factor: Duration, max_delay: Option<Duration>) -> ExponentialBackoff {
        ExponentialBackoff {
            current: 1,
            base,
            factor,
            max_delay,
        }
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    /// Resets the exponential back-off strategy to its initial state.
    pub fn reset(&mut self) {
        self.current = 1;
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let multiplier = u32::try_from(self.current).unwrap_or(u32::MAX);
        let duration = self.factor.checked_mul(multiplier).unwrap_or(Duration::MAX);

        if let Some(ref max_delay) = self.max_delay {
            if duration > *max_delay {
                return Some(*max_delay);
            }
        }

        self.current = self.current.checked_mul(self.base).unwrap_or(u64::MAX);

        Some(duration)
    }
}

/// Retry policy parameters.
#[derive(Clone, Copy, Debug, Builder)]
pub struct RetrySettings {
    /// Total attempts per job, including the first.
    #[builder(default = default_max_retries())]
    pub(crate) max_retries: u32,

    #[builder(default = default_backoff_base())]
    pub(crate) backoff_base: u64,

    /// Delay before the first retry, before jitter.
    #[builder(default = default_backoff_unit())]
    pub(crate) backoff_unit: Duration,

    #[builder(default)]
    pub(crate) jitter: JitterMode,

    /// Per-attempt timeout multiplier applied after a timeout.
    #[builder(default = default_timeout_growth())]
    pub(crate) timeout_growth: f64,

    #[builder(default = default_max_timeout())]
    pub(crate) max_timeout: Duration,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_backoff_base() -> u64 {
    2
}

const fn default_backoff_unit() -> Duration {
    Duration::from_secs(1)
}

const fn default_timeout_growth() -> f64 {
    1.5
}

const fn default_max_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            backoff_unit: default_backoff_unit(),
            jitter: JitterMode::default(),
            timeout_growth: default_timeout_growth(),
            max_timeout: default_max_timeout(),
        }
    }
}

impl RetrySettings {
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Retry state of one job.
///
/// Created with the job's initial timeout; every failed attempt is fed to
/// [`RetryState::on_failure`], which advances the attempt counter, the
/// backoff iterator and (on timeouts) the per-attempt timeout.
#[derive(Debug, Clone)]
pub struct RetryState<L> {
    attempts: u32,
    max_attempts: u32,
    timeout: Duration,
    timeout_growth: f64,
    max_timeout: Duration,
    backoff: ExponentialBackoff,
    jitter_mode: JitterMode,
    logic: L,
}

impl<L: RetryLogic<Error = HttpError>> RetryState<L> {
    pub fn new(settings: &RetrySettings, initial_timeout: Duration, logic: L) -> Self {
        Self {
            attempts: 0,
            max_attempts: settings.max_retries.max(1),
            timeout: initial_timeout.min(settings.max_timeout),
            timeout_growth: settings.timeout_growth,
            max_timeout: settings.max_timeout,
            backoff: ExponentialBackoff::new(settings.backoff_base, settings.backoff_unit, None),
            jitter_mode: settings.jitter,
            logic,
        }
    }

    /// Marks the start of an attempt and returns its timeout.
    pub fn begin_attempt(&mut self) -> Duration {
        self.attempts += 1;
        self.timeout
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn on_failure(&mut self, error: &HttpError) -> RetryAction {
        if !self.logic.is_retriable_error(error) {
            return RetryAction::DontRetry(Cow::Owned(format!("not retriable: {}", error)));
        }
        if self.remaining_attempts() == 0 {
            return RetryAction::DontRetry(Cow::Owned(format!(
                "retries exhausted after {} attempts: {}",
                self.attempts, error
            )));
        }

        if error.is_timeout() {
            self.timeout = grow_timeout(self.timeout, self.timeout_growth, self.max_timeout);
        }

        let base_delay = self.backoff.next().unwrap_or(self.max_timeout);
        let delay = self.jitter_mode.apply(base_delay);
        debug!(
            message = "Retrying request with exponential backoff.",
            base_delay_ms = base_delay.as_millis(),
            delay_ms = delay.as_millis(),
            next_timeout_ms = self.timeout.as_millis(),
            attempts_remaining = self.remaining_attempts()
        );
        RetryAction::Retry {
            delay,
            reason: Cow::Owned(error.to_string()),
        }
    }
}
