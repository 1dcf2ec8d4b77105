//! Retry Manager (spec §4.F): classifies a response into
//! `{ok, body} | {retry, after_ms, metadata} | {fatal, error}` and drives
//! the actual sleep-and-retry loop with `backon`, mirroring the reference
//! implementation's use of `ExponentialBuilder` for upstream calls.

use crate::error::GeminiError;
use backon::{BackoffBuilder, ExponentialBuilder};
use rand::Rng;
use serde_json::Value;
use std::time::Duration;

/// One classified outcome of a single attempt.
pub enum Classification {
    Ok,
    Retry {
        after_ms: u64,
        quota_metric: Option<String>,
        quota_id: Option<String>,
        quota_dimensions: Option<Value>,
    },
    Fatal,
}

/// Classifies an HTTP status + decoded error body per spec §4.F's rules.
/// `attempt` is zero-based and only consulted for the backoff formula when
/// the server gives no explicit `RetryInfo`.
pub fn classify(status: u16, details: Option<&Value>, attempt: u32, base_backoff_ms: u64, jitter_factor: f64) -> Classification {
    if (200..300).contains(&status) {
        return Classification::Ok;
    }

    if status == 401 || status == 403 {
        return Classification::Fatal;
    }

    if status == 429 || status == 503 {
        if let Some(retry_info) = find_retry_info(details) {
            return Classification::Retry {
                after_ms: retry_info.after_ms,
                quota_metric: retry_info.quota_metric,
                quota_id: retry_info.quota_id,
                quota_dimensions: retry_info.quota_dimensions,
            };
        }
        let after_ms = exponential_backoff_ms(attempt, base_backoff_ms, jitter_factor);
        return Classification::Retry {
            after_ms,
            quota_metric: None,
            quota_id: None,
            quota_dimensions: None,
        };
    }

    if (400..500).contains(&status) {
        return Classification::Fatal;
    }

    if (500..600).contains(&status) {
        // 503 already handled above; every other 5xx retries up to
        // max_attempts, counted by the caller.
        let after_ms = exponential_backoff_ms(attempt, base_backoff_ms, jitter_factor);
        return Classification::Retry {
            after_ms,
            quota_metric: None,
            quota_id: None,
            quota_dimensions: None,
        };
    }

    Classification::Fatal
}

/// Whether a transport-level failure (no HTTP status at all: connection
/// refused, reset, timed out) should be retried. Per spec §4.F this is
/// always true -- these are presumed transient.
pub fn classify_transport_error(_error: &GeminiError) -> Classification {
    Classification::Retry {
        after_ms: 0,
        quota_metric: None,
        quota_id: None,
        quota_dimensions: None,
    }
}

struct RetryInfo {
    after_ms: u64,
    quota_metric: Option<String>,
    quota_id: Option<String>,
    quota_dimensions: Option<Value>,
}

fn find_retry_info(details: Option<&Value>) -> Option<RetryInfo> {
    let array = details?.get("error")?.get("details")?.as_array()?;
    let entry = array.iter().find(|d| {
        d.get("@type")
            .and_then(Value::as_str)
            .is_some_and(|t| t.ends_with("RetryInfo"))
    })?;
    let retry_delay = entry.get("retryDelay").and_then(Value::as_str)?;
    let after_ms = parse_duration(retry_delay)?;
    Some(RetryInfo {
        after_ms,
        quota_metric: entry.get("quotaMetric").and_then(Value::as_str).map(str::to_string),
        quota_id: entry.get("quotaId").and_then(Value::as_str).map(str::to_string),
        quota_dimensions: entry.get("quotaDimensions").cloned(),
    })
}

/// Parses Google RPC duration strings (`"60s"`, `"1.5s"`, `"500ms"`, `"2m"`)
/// into milliseconds (spec §4.F, testable property #5).
pub fn parse_duration(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (number, unit) = if let Some(stripped) = raw.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = raw.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = raw.strip_suffix('m') {
        (stripped, "m")
    } else {
        return None;
    };
    let value: f64 = number.parse().ok()?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1000.0,
        "m" => value * 60_000.0,
        _ => unreachable!(),
    };
    Some(millis.round() as u64)
}

fn exponential_backoff_ms(attempt: u32, base_backoff_ms: u64, jitter_factor: f64) -> u64 {
    let base = base_backoff_ms as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::rng().random_range(-jitter_factor..=jitter_factor);
    (base * (1.0 + jitter)).max(0.0).round() as u64
}

/// Builds the `backon` policy used to drive a retry loop for a profile,
/// capped at `max_backoff_ms`.
pub fn backoff_policy(base_backoff_ms: u64, max_attempts: u32, max_backoff_ms: u64) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(base_backoff_ms))
        .with_max_delay(Duration::from_millis(max_backoff_ms))
        .with_max_times(max_attempts as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_four_duration_forms() {
        assert_eq!(parse_duration("60s"), Some(60_000));
        assert_eq!(parse_duration("1.5s"), Some(1_500));
        assert_eq!(parse_duration("500ms"), Some(500));
        assert_eq!(parse_duration("2m"), Some(120_000));
    }

    #[test]
    fn rejects_unrecognized_unit() {
        assert_eq!(parse_duration("1h"), None);
        assert_eq!(parse_duration("nonsense"), None);
    }

    #[test]
    fn classifies_2xx_as_ok() {
        assert!(matches!(classify(200, None, 0, 1000, 0.2), Classification::Ok));
    }

    #[test]
    fn classifies_401_403_as_fatal() {
        assert!(matches!(classify(401, None, 0, 1000, 0.2), Classification::Fatal));
        assert!(matches!(classify(403, None, 0, 1000, 0.2), Classification::Fatal));
    }

    #[test]
    fn classifies_429_with_retry_info_using_server_delay() {
        let details = serde_json::json!({
            "error": {
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.RetryInfo",
                    "retryDelay": "45s",
                    "quotaMetric": "generativelanguage.googleapis.com/generate_content_requests",
                }]
            }
        });
        match classify(429, Some(&details), 0, 1000, 0.2) {
            Classification::Retry { after_ms, quota_metric, .. } => {
                assert_eq!(after_ms, 45_000);
                assert_eq!(quota_metric.as_deref(), Some("generativelanguage.googleapis.com/generate_content_requests"));
            }
            _ => panic!("expected retry"),
        }
    }

    #[test]
    fn classifies_429_without_hints_using_exponential_backoff() {
        match classify(429, None, 2, 1000, 0.0) {
            Classification::Retry { after_ms, .. } => assert_eq!(after_ms, 4000),
            _ => panic!("expected retry"),
        }
    }

    #[test]
    fn classifies_other_4xx_as_fatal() {
        assert!(matches!(classify(400, None, 0, 1000, 0.2), Classification::Fatal));
    }

    #[test]
    fn classifies_other_5xx_as_retry() {
        assert!(matches!(classify(500, None, 0, 1000, 0.2), Classification::Retry { .. }));
    }
}
