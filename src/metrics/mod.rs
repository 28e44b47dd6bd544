//! Metrics for portcullis
//!
//! Recording goes through the `metrics` facade; the Prometheus recorder is
//! installed once at startup and rendered by `GET /metrics`. Without an
//! installed recorder every call here is a no-op.

use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::types::ErrorClass;

// ============================================================================
// Metric Names
// ============================================================================

/// Total signup attempts.
pub const SIGNUP_REQUESTS_TOTAL: &str = "portcullis_signup_requests_total";
/// Total successful signups.
pub const SIGNUP_SUCCESS_TOTAL: &str = "portcullis_signup_success_total";
/// Failed signups by error class.
pub const SIGNUP_ERRORS_TOTAL: &str = "portcullis_signup_errors_total";
/// Signup latency (seconds).
pub const SIGNUP_DURATION_SECONDS: &str = "portcullis_signup_duration_seconds";
/// Total login attempts.
pub const LOGIN_REQUESTS_TOTAL: &str = "portcullis_login_requests_total";
/// Total successful logins.
pub const LOGIN_SUCCESS_TOTAL: &str = "portcullis_login_success_total";
/// Failed logins by error class.
pub const LOGIN_FAILED_TOTAL: &str = "portcullis_login_failed_total";
/// Logins refused by the rate limiter.
pub const LOGIN_RATE_LIMITED_TOTAL: &str = "portcullis_login_rate_limited_total";
/// Login latency (seconds).
pub const LOGIN_DURATION_SECONDS: &str = "portcullis_login_duration_seconds";
/// Store operation latency by backend, operation and outcome (seconds).
pub const STORE_OPERATION_DURATION_SECONDS: &str = "portcullis_store_operation_duration_seconds";

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Install the global Prometheus recorder and return its render handle.
pub fn install_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .map_err(|e| format!("invalid histogram buckets: {}", e))?
        .install_recorder()
        .map_err(|e| format!("failed to install prometheus recorder: {}", e))
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

#[inline]
pub fn record_signup_request() {
    counter!(SIGNUP_REQUESTS_TOTAL).increment(1);
}

pub fn record_signup_success(elapsed: Duration) {
    counter!(SIGNUP_SUCCESS_TOTAL).increment(1);
    histogram!(SIGNUP_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

pub fn record_signup_error(class: ErrorClass, elapsed: Duration) {
    counter!(SIGNUP_ERRORS_TOTAL, "class" => class.as_str()).increment(1);
    histogram!(SIGNUP_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

#[inline]
pub fn record_login_request() {
    counter!(LOGIN_REQUESTS_TOTAL).increment(1);
}

pub fn record_login_success(elapsed: Duration) {
    counter!(LOGIN_SUCCESS_TOTAL).increment(1);
    histogram!(LOGIN_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

pub fn record_login_failure(class: ErrorClass, elapsed: Duration) {
    counter!(LOGIN_FAILED_TOTAL, "class" => class.as_str()).increment(1);
    histogram!(LOGIN_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

#[inline]
pub fn record_login_rate_limited() {
    counter!(LOGIN_RATE_LIMITED_TOTAL).increment(1);
}

/// `outcome` is `"ok"` or an [`ErrorClass`] label.
pub fn record_store_operation(
    backend: &'static str,
    op: &'static str,
    outcome: &'static str,
    elapsed: Duration,
) {
    histogram!(
        STORE_OPERATION_DURATION_SECONDS,
        "backend" => backend,
        "op" => op,
        "outcome" => outcome
    )
    .record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_share_prefix() {
        for name in [
            SIGNUP_REQUESTS_TOTAL,
            SIGNUP_SUCCESS_TOTAL,
            SIGNUP_ERRORS_TOTAL,
            SIGNUP_DURATION_SECONDS,
            LOGIN_REQUESTS_TOTAL,
            LOGIN_SUCCESS_TOTAL,
            LOGIN_FAILED_TOTAL,
            LOGIN_RATE_LIMITED_TOTAL,
            LOGIN_DURATION_SECONDS,
            STORE_OPERATION_DURATION_SECONDS,
        ] {
            assert!(name.starts_with("portcullis_"), "{name}");
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_signup_request();
        record_login_failure(ErrorClass::Unauthorized, Duration::from_millis(3));
        record_store_operation("sql", "find_one", "ok", Duration::from_millis(1));
    }
}
