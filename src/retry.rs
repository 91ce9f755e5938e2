// src/retry.rs

use crate::models::FailureKind;
use std::time::Duration;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry; the failure is terminal for this task.
    NoRetry,
    /// Transition to Resumable and re-admit after the given delay.
    RetryAfter(Duration),
}

/// Capped exponential backoff for transient failures.
///
/// Integrity mismatches, archive format errors, filesystem errors and
/// HTTP 4xx responses are never retried automatically: they indicate a
/// non-transient mismatch between manifest and server content.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn retryable(kind: FailureKind) -> bool {
        match kind {
            FailureKind::TransientNetwork => true,
            // 5xx and throttling are server-side hiccups; 4xx means the
            // manifest and the server disagree about the content.
            FailureKind::HttpStatus(status) => status == 429 || (500..=599).contains(&status),
            FailureKind::Integrity | FailureKind::Format | FailureKind::Filesystem => false,
        }
    }

    /// Decide what to do after the `attempt`-th failed attempt (1-based).
    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if !Self::retryable(kind) || attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        let exp = 1u32 << attempt.saturating_sub(1).min(8);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RetryAfter(delay)
    }
}
