//! Circuit breaker state machine.
//!
//! A breaker guards one fragile operation (for example "apply migration
//! batch 7"). The transition logic here is pure: it mutates a
//! [`BreakerRecord`] given an outcome and the current time, and never reads a
//! clock or schedules work. The `open -> half_open` timeout is evaluated
//! lazily on every access.
//!
//! ```text
//! closed    --failure x threshold-->  open
//! open      --now >= deadline------>  half_open   (on next access)
//! half_open --success-------------->  closed
//! half_open --failure-------------->  open        (timeout restarts)
//! ```
//!
//! The half-open probe slot is a lease: if its holder never reports, the
//! slot is released once the recovery timeout has elapsed again.

use crate::domain::time::{add_duration, duration_secs};
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Failures needed to open a breaker that was never configured.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Time an open breaker waits before admitting a probe, unless configured.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Operating normally
    Closed,
    /// Failing fast until the recovery deadline passes
    Open,
    /// Admitting a single probe to test recovery
    HalfOpen,
}

impl BreakerState {
    /// Stable lowercase name, as persisted and logged.
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBreakerConfig")]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens (at least 1)
    pub threshold: u32,
    /// How long the breaker stays open before admitting a probe
    #[serde(rename = "timeout_seconds", with = "duration_secs")]
    pub timeout: Duration,
}

#[derive(Deserialize)]
struct RawBreakerConfig {
    #[serde(default = "default_threshold")]
    threshold: u32,
    #[serde(default = "default_timeout_secs")]
    timeout_seconds: u64,
}

fn default_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_timeout_secs() -> u64 {
    DEFAULT_RECOVERY_TIMEOUT.as_secs()
}

impl TryFrom<RawBreakerConfig> for BreakerConfig {
    type Error = ConfigError;

    fn try_from(raw: RawBreakerConfig) -> Result<Self, Self::Error> {
        BreakerConfig::new(raw.threshold, Duration::from_secs(raw.timeout_seconds))
    }
}

impl BreakerConfig {
    /// Create a validated configuration.
    ///
    /// # Errors
    /// Returns `ConfigError::ZeroThreshold` if `threshold` is zero. A zero
    /// timeout is allowed: the breaker then admits a probe on the next access.
    pub fn new(threshold: u32, timeout: Duration) -> Result<Self, ConfigError> {
        let config = Self { threshold, timeout };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants of a configuration built through its public fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILURE_THRESHOLD,
            timeout: DEFAULT_RECOVERY_TIMEOUT,
        }
    }
}

/// Result of applying one outcome to a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State after lazy timeout evaluation, before the outcome was applied
    pub observed: BreakerState,
    /// State after the outcome was applied
    pub state: BreakerState,
    /// False when the breaker was open and the outcome was rejected
    pub applied: bool,
}

impl Transition {
    /// Whether this outcome moved the breaker into `open`.
    pub fn opened(&self) -> bool {
        self.observed != BreakerState::Open && self.state == BreakerState::Open
    }

    /// Whether this outcome closed a half-open breaker.
    pub fn recovered(&self) -> bool {
        self.observed == BreakerState::HalfOpen && self.state == BreakerState::Closed
    }
}

/// Persisted state of one named breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: BreakerState,
    pub failure_count: u64,
    pub config: BreakerConfig,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_deadline: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Set while the single half-open probe is outstanding
    pub probe_in_flight: bool,
    /// When an unreported probe is considered lost
    #[serde(default)]
    pub probe_deadline: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    /// A fresh, closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            config,
            opened_at: None,
            half_open_deadline: None,
            last_failure_at: None,
            probe_in_flight: false,
            probe_deadline: None,
        }
    }

    /// State as seen at `now`, without mutating the record.
    pub fn view(&self, now: DateTime<Utc>) -> BreakerState {
        if self.state == BreakerState::Open && self.deadline_passed(now) {
            BreakerState::HalfOpen
        } else {
            self.state
        }
    }

    /// Apply the lazy `open -> half_open` transition and return the current state.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> BreakerState {
        if self.state == BreakerState::Open && self.deadline_passed(now) {
            self.state = BreakerState::HalfOpen;
            self.release_probe();
        }
        self.state
    }

    /// Apply the outcome of the guarded operation.
    pub fn apply(&mut self, success: bool, now: DateTime<Utc>) -> Transition {
        let observed = self.evaluate(now);

        match (observed, success) {
            (BreakerState::Open, _) => {
                return Transition {
                    observed,
                    state: BreakerState::Open,
                    applied: false,
                };
            }
            (BreakerState::Closed, true) => {
                self.failure_count = 0;
            }
            (BreakerState::Closed, false) => {
                self.record_failure(now);
                if self.failure_count >= u64::from(self.config.threshold) {
                    self.trip(now);
                }
            }
            (BreakerState::HalfOpen, true) => {
                self.state = BreakerState::Closed;
                self.failure_count = 0;
                self.opened_at = None;
                self.half_open_deadline = None;
            }
            (BreakerState::HalfOpen, false) => {
                self.record_failure(now);
                self.trip(now);
            }
        }

        self.release_probe();
        Transition {
            observed,
            state: self.state,
            applied: true,
        }
    }

    /// Ask whether the guarded operation may run now.
    ///
    /// In `half_open` only the first caller gets the probe slot. It stays
    /// taken until an outcome is applied or the probe deadline
    /// (`now + timeout` at acquisition) passes, whichever comes first.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        match self.evaluate(now) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if self.probe_in_flight && !self.probe_lost(now) {
                    return false;
                }
                self.probe_in_flight = true;
                self.probe_deadline = Some(add_duration(now, self.config.timeout));
                true
            }
        }
    }

    /// Whether the outstanding probe was granted and never reported in time.
    pub fn probe_lost(&self, now: DateTime<Utc>) -> bool {
        self.probe_in_flight
            && self
                .probe_deadline
                .map_or(true, |deadline| now >= deadline)
    }

    /// Return to `closed`, keeping the configuration.
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    fn release_probe(&mut self) {
        self.probe_in_flight = false;
        self.probe_deadline = None;
    }

    fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.half_open_deadline = Some(add_duration(now, self.config.timeout));
    }

    fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        // An open record without a deadline can only come from a hand-edited
        // store; treat it as already expired so it can recover.
        self.half_open_deadline.map_or(true, |deadline| now >= deadline)
    }
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
