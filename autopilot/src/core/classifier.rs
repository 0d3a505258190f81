//! Deterministic classification of worker failures.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Coarse failure category used for retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The worker ran past its configured timeout.
    Timeout,
    /// Credentials were rejected.
    Auth,
    /// The worker process could not be started.
    Spawn,
    /// Non-zero or abnormal completion.
    Execution,
    /// Execution failure whose text matches a rate-limit signature.
    RateLimit,
    /// The worker completed but its output was not usable structured data.
    Parse,
    /// The handle was already released by its pool.
    Released,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::Spawn => "spawn",
            ErrorKind::Execution => "execution",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Parse => "parse",
            ErrorKind::Released => "released",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Kinds that are never retried, regardless of remaining budget.
pub const DEFAULT_NON_RETRYABLE: [ErrorKind; 3] =
    [ErrorKind::Timeout, ErrorKind::Auth, ErrorKind::Spawn];

static RATE_LIMIT_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b429\b|rate[\s_-]?limit|too many requests|resource[\s_-]?exhausted|quota")
        .unwrap_or_else(|err| panic!("rate limit pattern must compile: {err}"))
});

/// True if `text` carries a rate-limit signature (HTTP 429, "rate limit",
/// "resource exhausted", "quota").
pub fn is_rate_limit_message(text: &str) -> bool {
    RATE_LIMIT_SIGNATURE.is_match(text)
}
