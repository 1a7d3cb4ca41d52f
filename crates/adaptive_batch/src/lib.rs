//! Adaptive batch execution against a rate-limited text compression API.
//!
//! This crate drains a queue of compression jobs through a fixed pool of
//! worker tasks while a shared controller decides how many requests may be
//! in flight at once. The controller follows an AIMD-style policy adapted to
//! request concurrency:
//!
//! 1. **Multiplicative decrease**: a rate-limit response halves the permitted
//!    worker count immediately.
//! 2. **Soft decrease**: an error rate above 10% over an adjustment interval
//!    removes one worker.
//! 3. **Additive increase**: a quiet interval (more than 50 successes, low
//!    latency, under 2% errors) adds one worker, up to the recommended count.
//!
//! The permitted count is enforced by a shrinkable semaphore that every
//! worker acquires before each request, so shrinking never aborts an
//! in-flight call.
//!
//! # Basic Usage
//! ```no_run
//! use adaptive_batch::{BatchOrchestrator, BatchSettings, Job, MemoryCache, RawResponse};
//! use adaptive_batch::adaptive_concurrency::http::HttpError;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), adaptive_batch::BatchError> {
//! let endpoint = tower::service_fn(|_req: adaptive_batch::CompressionRequest| async {
//!     Ok::<_, HttpError>(RawResponse::ok(r#"{"response":{"segments":[]}}"#))
//! });
//! let orchestrator = BatchOrchestrator::new(endpoint, Arc::new(MemoryCache::new()), BatchSettings::default());
//! let report = orchestrator.run(vec![Job::new(1, "some long text")]).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```
pub mod adaptive_concurrency;
pub mod batch;

#[macro_use]
extern crate tracing;

pub use adaptive_concurrency::controller::{ApiLimits, CapacitySource, ConcurrencyController, ConcurrencySnapshot};
pub use adaptive_concurrency::http::RawResponse;
pub use adaptive_concurrency::ConcurrencySettings;
pub use batch::cache::{CacheError, CacheKey, CachedResult, FailureRecord, JsonLinesCache, MemoryCache, ResultCache};
pub use batch::events::ProgressEvent;
pub use batch::executor::{CompressionRequest, RequestExecutor};
pub use batch::fingerprint::RequestFingerprint;
pub use batch::job::{
    AnalysisMode, FilterRule, Filters, Job, JobId, JobOverrides, ProcessingMode, RequestConfig, RequestDefaults,
};
pub use batch::orchestrator::{BatchError, BatchOrchestrator};
pub use batch::outcome::{FailureKind, JobReport, Outcome};
pub use batch::report::BatchReport;
pub use batch::BatchSettings;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
