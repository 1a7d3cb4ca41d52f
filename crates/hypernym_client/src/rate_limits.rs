use std::time::Duration;

use adaptive_batch::adaptive_concurrency::http::HttpError;
use adaptive_batch::{ApiLimits, CapacitySource, RawResponse};
use futures::future::BoxFuture;
use http::StatusCode;

use crate::payload::RateLimits;
use crate::service::{API_KEY_HEADER, HypernymService, decode, map_reqwest_error, read_response};

const RATE_LIMITS_TIMEOUT: Duration = Duration::from_secs(5);

impl CapacitySource for HypernymService {
    fn get_limits(&self) -> BoxFuture<'_, Result<ApiLimits, HttpError>> {
        Box::pin(async move {
            let inner = &self.inner;
            let response = inner
                .client
                .get(inner.endpoints.rate_limits.clone())
                .header(API_KEY_HEADER, &inner.config.api_key)
                .timeout(RATE_LIMITS_TIMEOUT)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let limits = parse_limits(read_response(response).await?)?;
            debug!(
                max_workers = ?limits.max_workers,
                requests_per_minute = ?limits.requests_per_window,
                "Fetched account rate limits"
            );
            Ok(limits)
        })
    }
}

fn parse_limits(response: RawResponse) -> Result<ApiLimits, HttpError> {
    let status = response.status;
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(HttpError::RateLimited {
            body: String::from_utf8_lossy(&response.body).into_owned(),
        });
    }
    if !status.is_success() {
        return Err(HttpError::ServerError {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&response.body).into_owned(),
        });
    }
    let reply: RateLimits = decode(&response)?;
    Ok(ApiLimits {
        max_workers: reply.recommended.and_then(|r| r.max_workers),
        requests_per_window: reply.limits.and_then(|l| l.requests_per_minute),
    })
}
