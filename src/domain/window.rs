//! Fixed rate-limit windows.
//!
//! A window counts attempts by one subject against one resource. Attempts
//! within `[window_start, window_start + window)` accumulate; the first
//! attempt after the window ends starts a new one with a count of 1.

use crate::domain::time::{add_duration, duration_secs};
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Attempt budget for one `check` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLimitConfig")]
pub struct LimitConfig {
    /// Attempts allowed per window (at least 1)
    pub max_attempts: u32,
    /// Window length (non-zero)
    #[serde(rename = "window_seconds", with = "duration_secs")]
    pub window: Duration,
}

#[derive(Deserialize)]
struct RawLimitConfig {
    max_attempts: u32,
    window_seconds: u64,
}

impl TryFrom<RawLimitConfig> for LimitConfig {
    type Error = ConfigError;

    fn try_from(raw: RawLimitConfig) -> Result<Self, Self::Error> {
        LimitConfig::new(raw.max_attempts, Duration::from_secs(raw.window_seconds))
    }
}

impl LimitConfig {
    /// Create a validated limit.
    ///
    /// # Errors
    /// Returns `ConfigError::ZeroMaxAttempts` or `ConfigError::ZeroWindow`.
    pub fn new(max_attempts: u32, window: Duration) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if window.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(Self {
            max_attempts,
            window,
        })
    }

    /// Shorthand for a window measured in seconds.
    pub fn per_seconds(max_attempts: u32, window_seconds: u64) -> Result<Self, ConfigError> {
        Self::new(max_attempts, Duration::from_secs(window_seconds))
    }
}

/// Identity of a window: the subject (usually an IP address) and the
/// protected resource (for example an invitation code).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub subject: String,
    pub resource: Option<String>,
}

impl WindowKey {
    pub fn new(subject: &str, resource: Option<&str>) -> Self {
        Self {
            subject: subject.to_string(),
            resource: resource.map(str::to_string),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{}|{}", self.subject, resource),
            None => write!(f, "{}|*", self.subject),
        }
    }
}

/// Persisted attempt counter for one `(subject, resource)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub attempt_count: u32,
    pub window_start: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub max_attempts: u32,
    #[serde(rename = "window_seconds", with = "duration_secs")]
    pub window: Duration,
}

impl RateLimitWindow {
    /// An empty window starting at `now`.
    pub fn open(limit: LimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            attempt_count: 0,
            window_start: now,
            last_attempt_at: now,
            max_attempts: limit.max_attempts,
            window: limit.window,
        }
    }

    /// First instant that is no longer inside this window.
    pub fn window_end(&self) -> DateTime<Utc> {
        add_duration(self.window_start, self.window)
    }

    /// Whether the window has ended at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.window_end() <= now
    }

    /// Count one attempt and return the new attempt count.
    ///
    /// Expiry is judged against the stored window length; the limit passed in
    /// becomes the stored configuration afterwards.
    pub fn register_attempt(&mut self, limit: LimitConfig, now: DateTime<Utc>) -> u32 {
        if self.is_expired(now) {
            self.window_start = now;
            self.attempt_count = 0;
        }
        self.max_attempts = limit.max_attempts;
        self.window = limit.window;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = now;
        self.attempt_count
    }

    /// Attempts left before the limit is exceeded.
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 18, 30, 0).unwrap()
    }

    #[test]
    fn test_counts_within_window() {
        let limit = LimitConfig::per_seconds(5, 60).unwrap();
        let mut w = RateLimitWindow::open(limit, t0());

        for expected in 1..=6 {
            let at = t0() + ChronoDuration::seconds(i64::from(expected) * 2);
            assert_eq!(w.register_attempt(limit, at), expected);
        }
        assert_eq!(w.window_start, t0());
        assert_eq!(w.window_end(), t0() + ChronoDuration::seconds(60));
        assert_eq!(w.attempts_remaining(), 0);
    }

    #[test]
    fn test_expired_window_restarts_at_one() {
        let limit = LimitConfig::per_seconds(5, 60).unwrap();
        let mut w = RateLimitWindow::open(limit, t0());
        for _ in 0..7 {
            w.register_attempt(limit, t0());
        }

        let later = t0() + ChronoDuration::seconds(60);
        assert!(w.is_expired(later));
        assert_eq!(w.register_attempt(limit, later), 1);
        assert_eq!(w.window_start, later);
        assert_eq!(w.attempts_remaining(), 4);
    }

    #[test]
    fn test_last_second_of_window_still_counts() {
        let limit = LimitConfig::per_seconds(2, 60).unwrap();
        let mut w = RateLimitWindow::open(limit, t0());
        w.register_attempt(limit, t0());

        let edge = t0() + ChronoDuration::seconds(59);
        assert!(!w.is_expired(edge));
        assert_eq!(w.register_attempt(limit, edge), 2);
    }

    #[test]
    fn test_limit_validation() {
        assert_eq!(
            LimitConfig::per_seconds(0, 60),
            Err(ConfigError::ZeroMaxAttempts)
        );
        assert_eq!(LimitConfig::per_seconds(5, 0), Err(ConfigError::ZeroWindow));

        let parsed: LimitConfig =
            serde_json::from_str(r#"{"max_attempts": 5, "window_seconds": 60}"#).unwrap();
        assert_eq!(parsed, LimitConfig::per_seconds(5, 60).unwrap());
        assert!(
            serde_json::from_str::<LimitConfig>(r#"{"max_attempts": 0, "window_seconds": 60}"#)
                .is_err()
        );
    }

    #[test]
    fn test_window_key_display() {
        assert_eq!(
            WindowKey::new("203.0.113.5", Some("INVITE-42")).to_string(),
            "203.0.113.5|INVITE-42"
        );
        assert_eq!(WindowKey::new("203.0.113.5", None).to_string(), "203.0.113.5|*");
    }
}
