//! Standardized limiter responses and quota headers.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::algorithms::Decision;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Fixed back-off clients are told after a throttle rejection.
pub const THROTTLE_RETRY_AFTER_SECS: u64 = 30;

const DEFAULT_DENIAL_MESSAGE: &str = "Too many requests, please slow down.";
const THROTTLE_MESSAGE: &str = "Server is busy handling your earlier requests, please retry shortly.";

/// 429 with a machine-readable code, a human-readable message, and a
/// `Retry-After` in whole seconds. Internal state (bucket levels,
/// reputation) never leaks beyond the documented headers.
pub fn rate_limited(
    decision: &Decision,
    message: Option<&str>,
    now_ms: u64,
    with_headers: bool,
) -> Response {
    let retry_after_secs = decision
        .reset_at_ms
        .saturating_sub(now_ms)
        .div_ceil(1_000)
        .max(1);
    let body = json!({
        "error": "rate_limit_exceeded",
        "message": message.unwrap_or(DEFAULT_DENIAL_MESSAGE),
        "retry_after": retry_after_secs,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    insert_header(response.headers_mut(), RETRY_AFTER, &retry_after_secs.to_string());
    if with_headers {
        apply_quota_headers(response.headers_mut(), decision);
    }
    response
}

/// 503 for a throttle rejection: fixed message, fixed retry-after.
pub fn throttled() -> Response {
    let body = json!({
        "error": "throttled",
        "message": THROTTLE_MESSAGE,
        "retry_after": THROTTLE_RETRY_AFTER_SECS,
    });
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    insert_header(
        response.headers_mut(),
        RETRY_AFTER,
        &THROTTLE_RETRY_AFTER_SECS.to_string(),
    );
    response
}

/// Attach quota headers to a successful downstream response without
/// touching its body or status.
pub fn decorate(response: &mut Response, decision: &Decision) {
    apply_quota_headers(response.headers_mut(), decision);
}

fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    insert_header(headers, HeaderName::from_static(HEADER_LIMIT), &decision.total.to_string());
    insert_header(
        headers,
        HeaderName::from_static(HEADER_REMAINING),
        &decision.remaining.to_string(),
    );
    insert_header(
        headers,
        HeaderName::from_static(HEADER_RESET),
        &iso8601(decision.reset_at_ms),
    );
}

fn insert_header(headers: &mut HeaderMap, name: impl Into<HeaderName>, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name.into(), value);
    }
}

fn iso8601(ms_since_epoch: u64) -> String {
    Utc.timestamp_millis_opt(ms_since_epoch as i64)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(allowed: bool, remaining: u32, reset_at_ms: u64, total: u32) -> Decision {
        Decision {
            allowed,
            remaining,
            reset_at_ms,
            total,
        }
    }

    #[test]
    fn denial_carries_retry_after_seconds() {
        let d = decision(false, 0, 1_001_000, 3);
        let response = rate_limited(&d, None, 1_000_500, true);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "1");
        assert_eq!(response.headers().get(HEADER_LIMIT).unwrap(), "3");
        assert_eq!(response.headers().get(HEADER_REMAINING).unwrap(), "0");
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let d = decision(false, 0, 1_000_100, 3);
        let response = rate_limited(&d, None, 1_000_099, false);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "1");
        assert!(response.headers().get(HEADER_LIMIT).is_none());
    }

    #[test]
    fn throttle_rejection_uses_fixed_backoff() {
        let response = throttled();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "30");
    }

    #[test]
    fn reset_header_is_iso8601() {
        assert_eq!(iso8601(0), "1970-01-01T00:00:00+00:00");
    }
}
