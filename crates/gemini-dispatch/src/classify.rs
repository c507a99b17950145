//! Response classification for retry decisions
//!
//! Distinguishes throttling (429, carries an optional server retry hint),
//! expired authentication (401, worth one token refresh), transient
//! failures (408/5xx, retryable with backoff), and fatal client errors
//! (remaining 4xx, never retried).

use std::time::Duration;

/// How a failed attempt should be handled.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Server throttled the request; wait at least the hint if one came back
    RateLimited { retry_hint: Option<Duration> },
    /// Token rejected; refresh once and re-attempt immediately
    AuthExpired,
    /// Retryable with exponential backoff
    Transient,
    /// Client error; retrying cannot help
    Fatal,
}

/// Classify an error response by HTTP status.
///
/// `retry_after` is the raw `Retry-After` header value, if present; the
/// body is scanned for a structured `google.rpc.RetryInfo` delay. The
/// header wins when both carry a hint.
pub fn classify_response(status: u16, retry_after: Option<&str>, body: &str) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited {
            retry_hint: retry_hint(retry_after, body),
        },
        401 => ErrorClass::AuthExpired,
        408 | 500 | 502 | 503 | 504 => ErrorClass::Transient,
        400..=499 => ErrorClass::Fatal,
        _ => ErrorClass::Transient,
    }
}

/// Extract a server retry hint from the header or the error body.
pub fn retry_hint(retry_after: Option<&str>, body: &str) -> Option<Duration> {
    if let Some(duration) = retry_after.and_then(parse_retry_after) {
        return Some(duration);
    }
    parse_retry_info(body)
}

/// `Retry-After` as integer seconds. HTTP-date values are not produced by
/// this API and parse as no hint.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// `retryDelay` from a `google.rpc.RetryInfo` entry in the error details:
///
/// ```json
/// {"error": {"details": [{"@type": ".../google.rpc.RetryInfo", "retryDelay": "32s"}]}}
/// ```
fn parse_retry_info(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let details = value.get("error")?.get("details")?.as_array()?;

    for detail in details {
        let type_url = detail.get("@type").and_then(|v| v.as_str()).unwrap_or("");
        if !type_url.ends_with("google.rpc.RetryInfo") {
            continue;
        }
        if let Some(delay) = detail.get("retryDelay").and_then(|v| v.as_str()) {
            return parse_proto_duration(delay);
        }
    }
    None
}

/// Protobuf JSON duration: decimal seconds with an `s` suffix ("32s",
/// "3.5s").
fn parse_proto_duration(text: &str) -> Option<Duration> {
    let seconds: f64 = text.strip_suffix('s')?.parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}
