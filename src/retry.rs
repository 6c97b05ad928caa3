use std::time::Duration;

use crate::config::MAX_RETRY_COUNT;
use crate::transport::TransferErrorKind;

/// Status codes treated as transient failures.
pub const RETRYABLE_STATUS_CODES: [u16; 9] = [423, 425, 429, 500, 502, 503, 504, 507, 510];

/// Upper bound of the per-attempt timeout once retries start.
pub const MAX_BACKOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one attempt, as seen by the retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    pub error: TransferErrorKind,
    pub status: u16,
    pub is_timeout: bool,
    pub retry_count: u32,
    pub max_retry: u32,
}

impl RetryDecision {
    pub fn new(error: TransferErrorKind, status: u16, retry_count: u32, max_retry: u32) -> Self {
        Self {
            error,
            status,
            is_timeout: error == TransferErrorKind::Timeout,
            retry_count,
            max_retry,
        }
    }
}

/// Fixed retry rules. Stateless: it never changes the retry count, callers
/// increment it between attempts.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn decide(&self, decision: &RetryDecision) -> bool {
        should_retry(
            decision.error,
            decision.status,
            decision.is_timeout,
            decision.retry_count,
            decision.max_retry,
        )
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        RETRYABLE_STATUS_CODES.contains(&status)
    }
}

/// Retry if attempts remain and the attempt timed out, ended with a
/// retryable status, or finished with neither an error code nor a status.
/// No budget allows more than [`MAX_RETRY_COUNT`] retries.
///
/// The last rule also fires for a transport that legitimately reports status
/// 0 without an error.
pub fn should_retry(
    error: TransferErrorKind,
    status: u16,
    is_timeout: bool,
    retry_count: u32,
    max_retry: u32,
) -> bool {
    if retry_count >= max_retry.min(MAX_RETRY_COUNT) {
        return false;
    }
    if is_timeout {
        return true;
    }
    if RETRYABLE_STATUS_CODES.contains(&status) {
        return true;
    }
    error.code() == 0 && status == 0
}

/// Timeout for the attempt numbered `retry_count` (already incremented):
/// 1s, 3s, 5s, 5s, ...
pub fn backoff_timeout(retry_count: u32) -> Duration {
    let seconds = u64::from(retry_count).saturating_mul(2).saturating_sub(1);
    Duration::from_secs(seconds).min(MAX_BACKOFF_TIMEOUT)
}

/// Timeout to use for the next attempt. A zero (unbounded) original timeout
/// is never shortened.
pub fn next_attempt_timeout(original: Duration, retry_count: u32) -> Duration {
    if original.is_zero() {
        return original;
    }
    backoff_timeout(retry_count)
}
