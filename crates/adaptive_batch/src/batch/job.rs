//! Jobs and their request parameters.
//!
//! Per-job parameters are a closed set of optional overrides layered over
//! batch-wide [`RequestDefaults`]. [`Job::resolve`] produces the effective
//! [`RequestConfig`], which is the single input to both the remote call and
//! the cache fingerprint.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Content longer than this (in chars) gets the large-content rules.
pub const LARGE_CONTENT_CHARS: usize = 10_000;
const LARGE_CONTENT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_AUTO_DETAIL_COUNT: u32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        JobId(id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// Single pass.
    #[default]
    Partial,
    /// Multi-trial analysis.
    Comprehensive,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Partial => "partial",
            AnalysisMode::Comprehensive => "comprehensive",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// One blocking request.
    #[default]
    Sync,
    /// Start a task and poll for its result.
    Async,
}

/// Exclusion rule for one semantic category.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterRule {
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Semantic filters keyed by category (e.g. `purpose`). Kept ordered so the
/// serialized form is canonical.
pub type Filters = BTreeMap<String, FilterRule>;

/// Every override a job may carry. Unknown keys are rejected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JobOverrides {
    pub compression_ratio: Option<f64>,
    pub similarity: Option<f64>,
    pub analysis_mode: Option<AnalysisMode>,
    pub force_detail_count: Option<u32>,
    pub force_single_segment: Option<bool>,
    pub include_embeddings: Option<bool>,
    pub filters: Option<Filters>,
    pub timeout_secs: Option<u64>,
    pub processing_mode: Option<ProcessingMode>,
}

/// Batch-wide request parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDefaults {
    pub compression_ratio: f64,
    pub similarity: f64,
    pub analysis_mode: AnalysisMode,
    pub force_detail_count: Option<u32>,
    pub force_single_segment: bool,
    pub include_embeddings: bool,
    pub filters: Option<Filters>,
    pub timeout: Duration,
    pub processing_mode: ProcessingMode,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            compression_ratio: 0.6,
            similarity: 0.75,
            analysis_mode: AnalysisMode::Partial,
            force_detail_count: None,
            force_single_segment: true,
            include_embeddings: false,
            filters: None,
            timeout: Duration::from_secs(30),
            processing_mode: ProcessingMode::Sync,
        }
    }
}

/// The effective parameters of one request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestConfig {
    pub compression_ratio: f64,
    pub similarity: f64,
    pub analysis_mode: AnalysisMode,
    pub force_detail_count: Option<u32>,
    pub force_single_segment: bool,
    pub include_embeddings: bool,
    pub filters: Option<Filters>,
    #[serde(skip)]
    pub timeout: Duration,
    #[serde(skip)]
    pub processing_mode: ProcessingMode,
}

/// One unit of work. Immutable once created.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(alias = "content")]
    pub text: String,
    #[serde(default, alias = "metadata")]
    pub overrides: JobOverrides,
}

impl Job {
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        Self {
            id: JobId(id),
            text: text.into(),
            overrides: JobOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: JobOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Layers the overrides over `defaults` and applies the large-content
    /// rules: without an explicit value, content over
    /// [`LARGE_CONTENT_CHARS`] gets a detail count of roughly ten per 10k
    /// chars (at most 50) and a 60 second timeout.
    pub fn resolve(&self, defaults: &RequestDefaults) -> RequestConfig {
        let o = &self.overrides;
        let chars = self.text.chars().count();
        let large = chars > LARGE_CONTENT_CHARS;

        let force_detail_count = o
            .force_detail_count
            .or(defaults.force_detail_count)
            .or_else(|| large.then(|| auto_detail_count(chars)));

        let timeout = match o.timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None if large => LARGE_CONTENT_TIMEOUT,
            None => defaults.timeout,
        };

        RequestConfig {
            compression_ratio: o.compression_ratio.unwrap_or(defaults.compression_ratio),
            similarity: o.similarity.unwrap_or(defaults.similarity),
            analysis_mode: o.analysis_mode.unwrap_or(defaults.analysis_mode),
            force_detail_count,
            force_single_segment: o.force_single_segment.unwrap_or(defaults.force_single_segment),
            include_embeddings: o.include_embeddings.unwrap_or(defaults.include_embeddings),
            filters: o.filters.clone().or_else(|| defaults.filters.clone()),
            timeout,
            processing_mode: o.processing_mode.unwrap_or(defaults.processing_mode),
        }
    }
}

fn auto_detail_count(chars: usize) -> u32 {
    let tens = u32::try_from(chars / LARGE_CONTENT_CHARS + 1).unwrap_or(u32::MAX);
    tens.saturating_mul(10).min(MAX_AUTO_DETAIL_COUNT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_defaults() {
        let job = Job::new(1, "short").with_overrides(JobOverrides {
            compression_ratio: Some(0.4),
            analysis_mode: Some(AnalysisMode::Comprehensive),
            timeout_secs: Some(90),
            ..Default::default()
        });
        let config = job.resolve(&RequestDefaults::default());
        assert_eq!(config.compression_ratio, 0.4);
        assert_eq!(config.similarity, 0.75);
        assert_eq!(config.analysis_mode, AnalysisMode::Comprehensive);
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert_eq!(config.force_detail_count, None);
    }

    #[test]
    fn large_content_gets_detail_count_and_longer_timeout() {
        let job = Job::new(2, "x".repeat(25_000));
        let config = job.resolve(&RequestDefaults::default());
        assert_eq!(config.force_detail_count, Some(30));
        assert_eq!(config.timeout, Duration::from_secs(60));

        let huge = Job::new(3, "x".repeat(200_000)).resolve(&RequestDefaults::default());
        assert_eq!(huge.force_detail_count, Some(50));
    }

    #[test]
    fn large_content_timeout_replaces_the_batch_default() {
        let defaults = RequestDefaults {
            timeout: Duration::from_secs(120),
            ..RequestDefaults::default()
        };
        let large = Job::new(5, "x".repeat(10_001)).resolve(&defaults);
        assert_eq!(large.timeout, Duration::from_secs(60));

        let small = Job::new(6, "x".repeat(10_000)).resolve(&defaults);
        assert_eq!(small.timeout, Duration::from_secs(120));
        assert_eq!(small.force_detail_count, None);
    }

    #[test]
    fn explicit_detail_count_disables_auto_rule() {
        let job = Job::new(4, "x".repeat(25_000)).with_overrides(JobOverrides {
            force_detail_count: Some(5),
            ..Default::default()
        });
        assert_eq!(job.resolve(&RequestDefaults::default()).force_detail_count, Some(5));
    }

    #[test]
    fn unknown_override_keys_are_rejected() {
        let err = serde_json::from_str::<JobOverrides>(r#"{"compression_ratio":0.5,"colour":"red"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("colour"), "{}", err);
    }

    #[test]
    fn jobs_deserialize_from_sample_rows() {
        let row = concat!(
            r#"{"id":42,"content":"The sun was setting","#,
            r#""metadata":{"processing_mode":"async","filters":{"purpose":{"exclude":["ads"]}}}}"#,
        );
        let job: Job = serde_json::from_str(row).unwrap();
        assert_eq!(job.id, JobId(42));
        assert_eq!(job.overrides.processing_mode, Some(ProcessingMode::Async));
        let filters = job.overrides.filters.unwrap();
        assert_eq!(filters["purpose"].exclude, vec!["ads".to_string()]);
    }
}
