//! Allow/deny decisions returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a request was denied.
///
/// Callers should show every variant to the end user as the same generic
/// "try again later" response; the distinction is for logs and audit only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The subject is on the blocklist
    Blocked,
    /// Too many attempts in the current window
    RateLimitExceeded,
    /// The guarding circuit breaker is open
    CircuitOpen,
    /// The safety store could not be reached; denied fail-safe
    Unavailable,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Blocked => "blocked",
            DenyReason::RateLimitExceeded => "rate_limit_exceeded",
            DenyReason::CircuitOpen => "circuit_open",
            DenyReason::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    /// Earliest time a retry can succeed, when known
    pub retry_after: Option<DateTime<Utc>>,
    pub attempts_remaining: u32,
}

impl Decision {
    pub fn allow(attempts_remaining: u32) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after: None,
            attempts_remaining,
        }
    }

    pub fn deny(reason: DenyReason, retry_after: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after,
            attempts_remaining: 0,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}
