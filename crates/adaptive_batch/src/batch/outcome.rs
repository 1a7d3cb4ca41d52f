use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::fingerprint::RequestFingerprint;
use super::job::JobId;
use crate::adaptive_concurrency::http::HttpError;

/// Why a job failed, for failures that are not a timeout or a rate limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Server { status: u16 },
    MalformedResponse,
    InvalidRequest,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transport => f.write_str("transport"),
            FailureKind::Server { status } => write!(f, "server ({})", status),
            FailureKind::MalformedResponse => f.write_str("malformed response"),
            FailureKind::InvalidRequest => f.write_str("invalid request"),
        }
    }
}

/// Terminal classification of one job.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Success {
        ratio: f64,
        latency: Duration,
        payload: serde_json::Value,
    },
    CacheHit {
        ratio: f64,
        payload: serde_json::Value,
    },
    RateLimited,
    Timeout,
    Error {
        kind: FailureKind,
        message: String,
    },
}

impl Outcome {
    /// Final outcome for an attempt that failed with `error`.
    pub fn from_error(error: &HttpError) -> Self {
        let kind = match error {
            HttpError::Timeout => return Outcome::Timeout,
            HttpError::RateLimited { .. } => return Outcome::RateLimited,
            HttpError::Transport { .. } => FailureKind::Transport,
            HttpError::ServerError { status, .. } => FailureKind::Server { status: *status },
            HttpError::MalformedResponse { .. } => FailureKind::MalformedResponse,
            HttpError::InvalidRequest { .. } => FailureKind::InvalidRequest,
        };
        Outcome::Error {
            kind,
            message: error.to_string(),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. } | Outcome::CacheHit { .. })
    }

    pub fn ratio(&self) -> Option<f64> {
        match self {
            Outcome::Success { ratio, .. } | Outcome::CacheHit { ratio, .. } => Some(*ratio),
            _ => None,
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::CacheHit { .. } => "cache_hit",
            Outcome::RateLimited => "rate_limited",
            Outcome::Timeout => "timeout",
            Outcome::Error { .. } => "error",
        }
    }

    /// Human readable description of a failure.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Outcome::RateLimited => Some("rate limited on every attempt".to_string()),
            Outcome::Timeout => Some("timed out on every attempt".to_string()),
            Outcome::Error { kind, message } => Some(format!("{}: {}", kind, message)),
            _ => None,
        }
    }
}

/// What happened to one job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobReport {
    pub job_id: JobId,
    pub fingerprint: RequestFingerprint,
    pub outcome: Outcome,
    /// Remote attempts made; zero for cache hits.
    pub attempts: u32,
}
