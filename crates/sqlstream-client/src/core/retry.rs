//! Retry classification for execute-query stream errors.
//!
//! | condition                                                      | handling     |
//! |----------------------------------------------------------------|--------------|
//! | DEADLINE_EXCEEDED, RESOURCE_EXHAUSTED, ABORTED, UNAVAILABLE    | retry        |
//! | INTERNAL mentioning `rst_stream` / `rst stream`                | retry        |
//! | FAILED_PRECONDITION + violation `PREPARED_QUERY_EXPIRED`       | plan expired |
//! | anything else                                                  | fatal        |
//!
//! New service-side conditions belong in this table, not in the state machine.

use std::time::Duration;

use crate::core::{
    config::RetryOptions,
    status::{Code, Status},
};

pub const DEFAULT_RETRY_CODES: &[Code] = &[
    Code::DeadlineExceeded,
    Code::ResourceExhausted,
    Code::Aborted,
    Code::Unavailable,
];

pub const PREPARED_QUERY_EXPIRED: &str = "PREPARED_QUERY_EXPIRED";

const MAX_JITTER_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    PlanExpired,
    Fatal,
}

/// Classifies a stream error. Plan expiry is checked before the code table.
pub fn classify(status: &Status, options: &RetryOptions) -> ErrorClass {
    if is_expired_query_error(status) {
        ErrorClass::PlanExpired
    } else if options.retry_codes.contains(&status.code) || is_rst_stream_error(status) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

pub fn is_expired_query_error(status: &Status) -> bool {
    status.code == Code::FailedPrecondition
        && status.violations().any(|v| v.kind == PREPARED_QUERY_EXPIRED)
}

pub fn is_rst_stream_error(status: &Status) -> bool {
    if status.code != Code::Internal {
        return false;
    }
    let message = status.message.to_lowercase();
    message.contains("rst_stream") || message.contains("rst stream")
}

/// Exponential backoff with up to 100ms of jitter, capped at `max_retry_delay`.
pub fn backoff_delay(options: &RetryOptions, num_errors: u32, jitter_ms: u64) -> Duration {
    let exp = options
        .retry_delay_multiplier
        .powi(num_errors.min(i32::MAX as u32) as i32);
    let base = options.initial_retry_delay_ms as f64 * exp;
    let delay = (base + jitter_ms as f64).min(options.max_retry_delay_ms as f64);
    Duration::from_millis(delay.max(0.0) as u64)
}

pub fn random_jitter_ms() -> u64 {
    rand::random::<u64>() % MAX_JITTER_MS
}
