//! Draining a batch of jobs through the worker pool.

pub mod cache;
pub mod events;
pub mod executor;
pub mod fingerprint;
pub mod job;
pub mod orchestrator;
pub mod outcome;
mod pool;
mod queue;
pub mod report;

use bon::Builder;

use crate::adaptive_concurrency::ConcurrencySettings;
use crate::adaptive_concurrency::retries::RetrySettings;
use job::RequestDefaults;

/// Everything a [`orchestrator::BatchOrchestrator`] needs besides its
/// collaborators.
///
/// # Example
///
/// ```rust
/// use adaptive_batch::BatchSettings;
/// use adaptive_batch::adaptive_concurrency::ConcurrencySettings;
///
/// let settings = BatchSettings::builder()
///     .concurrency(ConcurrencySettings::builder().initial_workers(2).build())
///     .use_cache(false)
///     .build();
/// assert!(!settings.use_cache());
/// ```
#[derive(Clone, Debug, Builder)]
pub struct BatchSettings {
    #[builder(default)]
    pub(crate) concurrency: ConcurrencySettings,

    #[builder(default)]
    pub(crate) retry: RetrySettings,

    #[builder(default)]
    pub(crate) defaults: RequestDefaults,

    /// Consult and populate the result cache.
    #[builder(default = default_use_cache())]
    pub(crate) use_cache: bool,
}

const fn default_use_cache() -> bool {
    true
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencySettings::default(),
            retry: RetrySettings::default(),
            defaults: RequestDefaults::default(),
            use_cache: default_use_cache(),
        }
    }
}

impl BatchSettings {
    pub fn concurrency(&self) -> &ConcurrencySettings {
        &self.concurrency
    }

    pub fn retry(&self) -> &RetrySettings {
        &self.retry
    }

    pub fn defaults(&self) -> &RequestDefaults {
        &self.defaults
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }
}
