//! `reqwest` client for the Hypernym text compression API.
//!
//! [`HypernymService`] is the endpoint a
//! [`BatchOrchestrator`](adaptive_batch::BatchOrchestrator) drives: a
//! `tower::Service<CompressionRequest>` that returns the raw status and body
//! and leaves classification and retries to the core. It also implements
//! [`CapacitySource`](adaptive_batch::CapacitySource) against the account's
//! rate-limit endpoint.

#[macro_use]
extern crate tracing;

mod config;
mod payload;
mod rate_limits;
mod service;

pub use config::{ConfigError, HypernymConfig};
pub use payload::{AnalyzePayload, AnalyzeParams};
pub use service::HypernymService;
