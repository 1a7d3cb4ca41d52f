use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use serde::Deserialize;
use snafu::Snafu;
use tower::timeout::error::Elapsed;

use crate::Error as CrateError;

/// Everything that can go wrong with one request attempt.
///
/// Endpoint services may return this directly or any boxed error; the
/// executor folds foreign errors into [`HttpError::Transport`] and tower's
/// [`Elapsed`] into [`HttpError::Timeout`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HttpError {
    /// The call did not complete within its per-attempt budget.
    #[snafu(display("Request timed out"))]
    Timeout,

    /// The server signaled throttling (HTTP 429).
    #[snafu(display("Rate limited by server: {}", body))]
    RateLimited { body: String },

    /// Network or connection failure.
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// Non-2xx, non-429 status.
    #[snafu(display("HTTP server error response (status {}): {}", status, body))]
    ServerError { status: u16, body: String },

    /// 2xx status whose body could not be understood.
    #[snafu(display("Malformed response body: {}", details))]
    MalformedResponse { details: String },

    /// The request could not be built or sent at all.
    #[snafu(display("Invalid request: {}", details))]
    InvalidRequest { details: String },
}

impl HttpError {
    /// Splits any service error into the taxonomy above.
    pub fn from_service_error(error: CrateError) -> Self {
        if error.is::<Elapsed>() {
            return HttpError::Timeout;
        }
        match error.downcast::<HttpError>() {
            Ok(http_error) => *http_error,
            Err(other) => HttpError::Transport { source: other },
        }
    }

    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, HttpError::RateLimited { .. })
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout)
    }
}

/// The undecoded answer of the remote endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn too_many_requests() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, Bytes::new())
    }
}

/// A decoded successful compression.
#[derive(Clone, Debug, PartialEq)]
pub struct Compressed {
    pub ratio: f64,
    pub payload: serde_json::Value,
}

#[derive(Deserialize)]
struct Segment {
    #[serde(default)]
    compression_ratio: f64,
}

#[derive(Deserialize, Default)]
struct ResponseSection {
    #[serde(default)]
    segments: Vec<Segment>,
}

/// Classifies a raw response into a decoded success or an attempt error.
///
/// The compression ratio is the mean of the per-segment ratios, found either
/// under `results.response.segments` (legacy wrapper) or `response.segments`.
pub fn classify_response(response: RawResponse) -> Result<Compressed, HttpError> {
    let status = response.status;
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(HttpError::RateLimited {
            body: body_preview(&response.body),
        });
    }
    if !status.is_success() {
        return Err(HttpError::ServerError {
            status: status.as_u16(),
            body: body_preview(&response.body),
        });
    }

    let payload: serde_json::Value =
        serde_json::from_slice(&response.body).map_err(|e| HttpError::MalformedResponse {
            details: e.to_string(),
        })?;
    if !payload.is_object() {
        return Err(HttpError::MalformedResponse {
            details: "response body is not a JSON object".to_string(),
        });
    }

    let inner = payload.get("results").unwrap_or(&payload);
    let section = match inner.get("response") {
        Some(section) => ResponseSection::deserialize(section).map_err(|e| {
            HttpError::MalformedResponse {
                details: format!("invalid `response` section: {}", e),
            }
        })?,
        None => ResponseSection::default(),
    };

    let ratio = if section.segments.is_empty() {
        0.0
    } else {
        section.segments.iter().map(|s| s.compression_ratio).sum::<f64>()
            / section.segments.len() as f64
    };

    Ok(Compressed { ratio, payload })
}

fn body_preview(body: &Bytes) -> String {
    String::from_utf8_lossy(body).chars().take(200).collect()
}

/// Per-attempt timeout: grows by `growth` and never exceeds `max`.
pub(crate) fn grow_timeout(current: Duration, growth: f64, max: Duration) -> Duration {
    current.mul_f64(growth).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_is_mean_of_segments() {
        let body = r#"{"response":{"segments":[{"compression_ratio":0.5},{"compression_ratio":0.7}]}}"#;
        let compressed = classify_response(RawResponse::ok(body)).unwrap();
        assert!((compressed.ratio - 0.6).abs() < 1e-9);
    }

    #[test]
    fn legacy_results_wrapper_is_unwrapped() {
        let body = r#"{"results":{"response":{"segments":[{"compression_ratio":0.4}]}}}"#;
        let compressed = classify_response(RawResponse::ok(body)).unwrap();
        assert!((compressed.ratio - 0.4).abs() < 1e-9);
        assert!(compressed.payload.get("results").is_some());
    }

    #[test]
    fn missing_segments_give_zero_ratio() {
        let compressed = classify_response(RawResponse::ok(r#"{"metadata":{}}"#)).unwrap();
        assert_eq!(compressed.ratio, 0.0);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_response(RawResponse::too_many_requests()),
            Err(HttpError::RateLimited { .. })
        ));
        assert!(matches!(
            classify_response(RawResponse::new(StatusCode::BAD_GATEWAY, "upstream")),
            Err(HttpError::ServerError { status: 502, .. })
        ));
        assert!(matches!(
            classify_response(RawResponse::ok("<html>")),
            Err(HttpError::MalformedResponse { .. })
        ));
        assert!(matches!(
            classify_response(RawResponse::ok("[1,2]")),
            Err(HttpError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn foreign_errors_are_transport() {
        let err: CrateError = "connection reset".into();
        assert!(matches!(
            HttpError::from_service_error(err),
            HttpError::Transport { .. }
        ));
        let elapsed: CrateError = Box::new(Elapsed::new());
        assert!(HttpError::from_service_error(elapsed).is_timeout());
        let wrapped: CrateError = Box::new(HttpError::RateLimited { body: String::new() });
        assert!(HttpError::from_service_error(wrapped).is_rate_limited());
    }

    #[test]
    fn timeout_growth_is_capped() {
        let max = Duration::from_secs(300);
        assert_eq!(grow_timeout(Duration::from_secs(30), 1.5, max), Duration::from_secs(45));
        assert_eq!(grow_timeout(Duration::from_secs(250), 1.5, max), max);
    }
}
