//! Retry budget and exponential backoff arithmetic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::classifier::{DEFAULT_NON_RETRYABLE, ErrorKind};

/// Per-role retry policy.
///
/// `max_retries` counts additional attempts: `0` means a single invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: u32,
    pub max_backoff_ms: u64,
    pub retry_on_rate_limit: bool,
    pub non_retryable: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2,
            max_backoff_ms: 60_000,
            retry_on_rate_limit: true,
            non_retryable: DEFAULT_NON_RETRYABLE.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total invocations allowed against one handle.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_non_retryable(&self, kind: ErrorKind) -> bool {
        self.non_retryable.contains(&kind)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = u64::from(self.backoff_multiplier.max(1))
            .checked_pow(retry - 1)
            .unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms.max(self.initial_backoff_ms));
        Duration::from_millis(ms)
    }
}
