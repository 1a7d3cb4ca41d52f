use std::time::Duration;

use adaptive_batch::{AnalysisMode, CompressionRequest, Filters, ProcessingMode};
use serde::{Deserialize, Serialize};

/// Server-side default processing budgets; `params.timeout` is only sent
/// when the request differs from these.
const SYNC_SERVER_TIMEOUT: Duration = Duration::from_secs(60);
const ASYNC_SERVER_TIMEOUT: Duration = Duration::from_secs(600);

/// Body of `analyze_sync` and `analyze_begin`.
#[derive(Debug, Serialize)]
pub struct AnalyzePayload<'a> {
    pub essay_text: &'a str,
    pub params: AnalyzeParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<&'a Filters>,
}

/// Optional keys are omitted when they hold the server's default.
#[derive(Debug, Default, PartialEq, Serialize)]
pub struct AnalyzeParams {
    pub min_compression_ratio: f64,
    pub min_semantic_similarity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_detail_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_single_segment: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_embeddings: Option<bool>,
}

impl<'a> AnalyzePayload<'a> {
    pub fn from_request(request: &'a CompressionRequest) -> Self {
        let config = &request.config;
        let server_default = match request.processing_mode() {
            ProcessingMode::Sync => SYNC_SERVER_TIMEOUT,
            ProcessingMode::Async => ASYNC_SERVER_TIMEOUT,
        };
        // Grown attempt budgets are fractional; the API takes whole seconds.
        let timeout_secs = request.timeout.as_secs_f64().ceil() as u64;

        Self {
            essay_text: &request.text,
            params: AnalyzeParams {
                min_compression_ratio: config.compression_ratio,
                min_semantic_similarity: config.similarity,
                analysis_mode: (config.analysis_mode != AnalysisMode::Partial).then(|| config.analysis_mode.as_str()),
                force_detail_count: config.force_detail_count,
                force_single_segment: config.force_single_segment.then_some(true),
                timeout: (timeout_secs != server_default.as_secs()).then_some(timeout_secs),
                include_embeddings: config.include_embeddings.then_some(true),
            },
            filters: config.filters.as_ref().filter(|filters| !filters.is_empty()),
        }
    }
}

/// Reply of `analyze_begin`.
#[derive(Debug, Deserialize)]
pub(crate) struct TaskStarted {
    pub(crate) task_id: String,
}

/// Reply of `analyze_status/<task_id>`.
#[derive(Debug, Deserialize)]
pub(crate) struct TaskStatus {
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) progress: Option<f64>,
    #[serde(default)]
    pub(crate) result: Option<serde_json::Value>,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

/// Reply of `user/rate-limits`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RateLimits {
    #[serde(default)]
    pub(crate) recommended: Option<Recommended>,
    #[serde(default)]
    pub(crate) limits: Option<Limits>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Recommended {
    #[serde(default)]
    pub(crate) max_workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Limits {
    #[serde(default)]
    pub(crate) requests_per_minute: Option<u64>,
}
