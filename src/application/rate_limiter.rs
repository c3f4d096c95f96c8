//! Rate limiter and blocklist coordination.
//!
//! The limiter decides whether a subject (an IP, account or API key) may
//! attempt a sensitive action now. The blocklist is consulted first and
//! short-circuits everything else; otherwise a fixed window counter is
//! incremented atomically through [`Storage::with_entry_mut`].
//!
//! # Fail-Safe Behavior
//! This is a security control, so it fails closed: if either store cannot be
//! reached the request is denied with [`DenyReason::Unavailable`].

use crate::application::audit::AuditLog;
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Storage};
use crate::domain::audit::{AuditEvent, AuditEventType};
use crate::domain::blocklist::BlocklistEntry;
use crate::domain::decision::{Decision, DenyReason};
use crate::domain::time::{add_duration, duration_secs};
use crate::domain::window::{LimitConfig, RateLimitWindow, WindowKey};
use crate::error::{ConfigError, SafetyError, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Default ratio of attempts to `max_attempts` that triggers an automatic block.
pub const DEFAULT_AUTO_BLOCK_MULTIPLIER: u32 = 3;

/// Default length of an automatic block.
pub const DEFAULT_AUTO_BLOCK_DURATION: Duration = Duration::from_secs(60 * 60);

/// `created_by` recorded on automatic blocklist entries.
pub const AUTO_BLOCK_CREATOR: &str = "rate_limiter";

/// Escalation from rate limiting to blocking.
///
/// When a subject's attempt count in one window reaches
/// `max_attempts * multiplier`, it is blocked for `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAutoBlockConfig")]
pub struct AutoBlockConfig {
    pub multiplier: u32,
    #[serde(rename = "duration_seconds", with = "duration_secs")]
    pub duration: Duration,
}

#[derive(Deserialize)]
struct RawAutoBlockConfig {
    #[serde(default = "default_multiplier")]
    multiplier: u32,
    #[serde(default = "default_duration_secs")]
    duration_seconds: u64,
}

fn default_multiplier() -> u32 {
    DEFAULT_AUTO_BLOCK_MULTIPLIER
}

fn default_duration_secs() -> u64 {
    DEFAULT_AUTO_BLOCK_DURATION.as_secs()
}

impl TryFrom<RawAutoBlockConfig> for AutoBlockConfig {
    type Error = ConfigError;

    fn try_from(raw: RawAutoBlockConfig) -> Result<Self, Self::Error> {
        AutoBlockConfig::new(raw.multiplier, Duration::from_secs(raw.duration_seconds))
    }
}

impl AutoBlockConfig {
    /// # Errors
    /// Returns `ConfigError::AutoBlockMultiplier` if `multiplier < 2`.
    pub fn new(multiplier: u32, duration: Duration) -> Result<Self, ConfigError> {
        if multiplier < 2 {
            return Err(ConfigError::AutoBlockMultiplier(multiplier));
        }
        Ok(Self {
            multiplier,
            duration,
        })
    }

    /// Attempt count at which a subject is blocked under `limit`.
    pub fn trigger_count(&self, limit: LimitConfig) -> u32 {
        limit.max_attempts.saturating_mul(self.multiplier)
    }
}

impl Default for AutoBlockConfig {
    fn default() -> Self {
        Self {
            multiplier: DEFAULT_AUTO_BLOCK_MULTIPLIER,
            duration: DEFAULT_AUTO_BLOCK_DURATION,
        }
    }
}

/// Entries removed by one [`RateLimiter::purge_expired`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeReport {
    pub windows_removed: usize,
    pub blocks_removed: usize,
}

/// Coordinates blocklist lookups, window counters and auto-blocking.
#[derive(Debug)]
pub struct RateLimiter<W, B>
where
    W: Storage<WindowKey, RateLimitWindow>,
    B: Storage<String, BlocklistEntry>,
{
    windows: W,
    blocklist: B,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    metrics: Metrics,
    auto_block: Option<AutoBlockConfig>,
}

impl<W, B> RateLimiter<W, B>
where
    W: Storage<WindowKey, RateLimitWindow>,
    B: Storage<String, BlocklistEntry>,
{
    /// Create a rate limiter.
    ///
    /// # Arguments
    /// * `windows` - Backend for per-(subject, resource) counters
    /// * `blocklist` - Backend for blocklist entries
    /// * `clock` - Time source
    /// * `audit` - Audit trail
    /// * `metrics` - Shared counters
    /// * `auto_block` - Escalation policy, `None` to disable
    pub fn new(
        windows: W,
        blocklist: B,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
        metrics: Metrics,
        auto_block: Option<AutoBlockConfig>,
    ) -> Self {
        Self {
            windows,
            blocklist,
            clock,
            audit,
            metrics,
            auto_block,
        }
    }

    /// Auto-block policy in effect, if any.
    pub fn auto_block(&self) -> Option<AutoBlockConfig> {
        self.auto_block
    }

    /// Register one attempt by `subject` on `resource` and decide.
    ///
    /// A blocked subject is denied without touching its counter. Otherwise
    /// the attempt is counted even when it ends up denied.
    pub fn check(&self, subject: &str, resource: Option<&str>, limit: LimitConfig) -> Decision {
        let now = self.clock.now();

        match self.live_block(subject, now) {
            Ok(Some(entry)) => {
                self.metrics.record_check(false);
                tracing::debug!(
                    subject,
                    resource,
                    blocked_by = %entry.created_by,
                    "attempt from blocked subject denied"
                );
                return Decision::deny(DenyReason::Blocked, entry.blocked_until);
            }
            Ok(None) => {}
            Err(err) => return self.fail_safe(subject, resource, "blocklist lookup", &err, now),
        }

        let counted = self.windows.with_entry_mut(
            WindowKey::new(subject, resource),
            || RateLimitWindow::open(limit, now),
            |window| {
                let count = window.register_attempt(limit, now);
                (count, window.window_end())
            },
        );
        let (attempt_count, window_end) = match counted {
            Ok(counted) => counted,
            Err(err) => return self.fail_safe(subject, resource, "window update", &err, now),
        };

        if attempt_count <= limit.max_attempts {
            self.metrics.record_check(true);
            return Decision::allow(limit.max_attempts - attempt_count);
        }

        self.metrics.record_check(false);
        tracing::warn!(
            subject,
            resource,
            attempt_count,
            max_attempts = limit.max_attempts,
            "rate limit exceeded"
        );
        self.audit.record(
            AuditEvent::new(AuditEventType::RateLimitExceeded, subject, now)
                .with_resource(resource)
                .with_details(json!({
                    "attempt_count": attempt_count,
                    "max_attempts": limit.max_attempts,
                    "window_seconds": limit.window.as_secs(),
                    "retry_after": window_end,
                })),
        );

        if let Some(auto_block) = self.auto_block {
            if attempt_count == auto_block.trigger_count(limit) {
                self.auto_block_subject(subject, resource, attempt_count, auto_block, now);
            }
        }

        Decision::deny(DenyReason::RateLimitExceeded, Some(window_end))
    }

    /// Block `subject` for `duration` (or permanently when `None`).
    ///
    /// Idempotent upsert: re-blocking replaces the entry and is audited again.
    ///
    /// # Errors
    /// Returns a `ConfigError` for an empty subject, or a `StoreError` if the
    /// blocklist cannot be written.
    pub fn block(
        &self,
        subject: &str,
        reason: &str,
        duration: Option<Duration>,
        created_by: &str,
    ) -> Result<(), SafetyError> {
        if subject.is_empty() {
            return Err(ConfigError::EmptyIdentifier("subject").into());
        }
        let now = self.clock.now();
        let entry = BlocklistEntry::new(subject, reason, duration, created_by, now);
        let blocked_until = entry.blocked_until;

        let previous = self.blocklist.insert(subject.to_string(), entry)?;
        let previously_blocked = previous.is_some_and(|p| p.is_active(now));

        self.metrics.record_block();
        tracing::warn!(
            subject,
            reason,
            created_by,
            permanent = blocked_until.is_none(),
            "subject blocked"
        );
        self.audit.record(
            AuditEvent::new(AuditEventType::SubjectBlocked, subject, now).with_details(json!({
                "reason": reason,
                "created_by": created_by,
                "blocked_until": blocked_until,
                "previously_blocked": previously_blocked,
            })),
        );
        Ok(())
    }

    /// Remove `subject` from the blocklist.
    ///
    /// Returns whether an entry existed. Window counters are left alone.
    pub fn unblock(&self, subject: &str, actor: &str) -> Result<bool, SafetyError> {
        let removed = self.blocklist.remove(&subject.to_string())?;
        let Some(entry) = removed else {
            return Ok(false);
        };

        tracing::info!(subject, unblocked_by = actor, "subject unblocked");
        self.audit.record(
            AuditEvent::new(AuditEventType::SubjectUnblocked, subject, self.clock.now())
                .with_details(json!({
                    "unblocked_by": actor,
                    "reason": entry.reason,
                    "created_by": entry.created_by,
                })),
        );
        Ok(true)
    }

    /// Whether `subject` is currently blocked. A store failure answers `true`.
    pub fn is_blocked(&self, subject: &str) -> bool {
        match self.live_block(subject, self.clock.now()) {
            Ok(entry) => entry.is_some(),
            Err(err) => {
                self.metrics.record_store_failure();
                tracing::error!(
                    subject,
                    error = %err,
                    "blocklist unavailable, treating subject as blocked"
                );
                true
            }
        }
    }

    /// Stored blocklist entry for `subject`, including an expired one not yet purged.
    pub fn blocklist_entry(&self, subject: &str) -> Result<Option<BlocklistEntry>, SafetyError> {
        Ok(self.blocklist.get(&subject.to_string())?)
    }

    /// Current counter for `(subject, resource)`.
    pub fn window(
        &self,
        subject: &str,
        resource: Option<&str>,
    ) -> Result<Option<RateLimitWindow>, SafetyError> {
        Ok(self.windows.get(&WindowKey::new(subject, resource))?)
    }

    /// Remove windows that ended more than `retention` ago and expired blocks.
    ///
    /// A window that is still inside its active period is never removed.
    pub fn purge_expired(&self, retention: Duration) -> Result<PurgeReport, SafetyError> {
        let now = self.clock.now();

        let windows_removed = self
            .windows
            .retain(|_, window| add_duration(window.window_end(), retention) > now)?;
        let blocks_removed = self.blocklist.retain(|_, entry| entry.is_active(now))?;

        self.metrics.record_windows_purged(windows_removed);
        if windows_removed > 0 || blocks_removed > 0 {
            tracing::debug!(windows_removed, blocks_removed, "purged expired entries");
        }

        Ok(PurgeReport {
            windows_removed,
            blocks_removed,
        })
    }

    fn live_block(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlocklistEntry>, StoreError> {
        Ok(self
            .blocklist
            .get(&subject.to_string())?
            .filter(|entry| entry.is_active(now)))
    }

    fn auto_block_subject(
        &self,
        subject: &str,
        resource: Option<&str>,
        attempt_count: u32,
        config: AutoBlockConfig,
        now: DateTime<Utc>,
    ) {
        let reason = format!("exceeded {attempt_count} attempts in one window");
        let entry = BlocklistEntry::new(
            subject,
            &reason,
            Some(config.duration),
            AUTO_BLOCK_CREATOR,
            now,
        );
        let blocked_until = entry.blocked_until;

        if let Err(err) = self.blocklist.insert(subject.to_string(), entry) {
            self.metrics.record_store_failure();
            tracing::error!(subject, error = %err, "failed to auto-block subject");
            return;
        }

        self.metrics.record_block();
        tracing::warn!(
            subject,
            resource,
            attempt_count,
            duration_seconds = config.duration.as_secs(),
            "subject auto-blocked"
        );
        self.audit.record(
            AuditEvent::new(AuditEventType::SubjectAutoBlocked, subject, now)
                .with_resource(resource)
                .with_details(json!({
                    "reason": reason,
                    "attempt_count": attempt_count,
                    "blocked_until": blocked_until,
                })),
        );
    }

    fn fail_safe(
        &self,
        subject: &str,
        resource: Option<&str>,
        operation: &'static str,
        err: &StoreError,
        now: DateTime<Utc>,
    ) -> Decision {
        self.metrics.record_store_failure();
        self.metrics.record_check(false);
        tracing::error!(
            subject,
            resource,
            operation,
            error = %err,
            "rate limit store unavailable, denying request"
        );
        self.audit.record(
            AuditEvent::new(AuditEventType::StoreUnavailable, subject, now)
                .with_resource(resource)
                .with_details(json!({
                    "operation": operation,
                    "error": err.to_string(),
                })),
        );
        Decision::deny(DenyReason::Unavailable, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::{AuditFilter, Severity};
    use crate::infrastructure::audit_sink::MemoryAuditSink;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::mocks::UnavailableStorage;
    use crate::infrastructure::storage::ShardedStorage;
    use std::thread;

    type MemoryLimiter = RateLimiter<
        ShardedStorage<WindowKey, RateLimitWindow>,
        ShardedStorage<String, BlocklistEntry>,
    >;

    struct Fixture {
        limiter: Arc<MemoryLimiter>,
        clock: ManualClock,
        audit: AuditLog,
        metrics: Metrics,
    }

    fn fixture(auto_block: Option<AutoBlockConfig>) -> Fixture {
        let clock = ManualClock::default();
        let metrics = Metrics::new();
        let audit = AuditLog::new(Arc::new(MemoryAuditSink::new()), metrics.clone());
        let limiter = RateLimiter::new(
            ShardedStorage::new(),
            ShardedStorage::new(),
            Arc::new(clock.clone()),
            audit.clone(),
            metrics.clone(),
            auto_block,
        );
        Fixture {
            limiter: Arc::new(limiter),
            clock,
            audit,
            metrics,
        }
    }

    fn five_per_minute() -> LimitConfig {
        LimitConfig::per_seconds(5, 60).unwrap()
    }

    #[test]
    fn test_invite_code_guessing_is_limited() {
        let f = fixture(None);
        let limit = five_per_minute();

        for expected_remaining in (0..5).rev() {
            let d = f.limiter.check("203.0.113.5", Some("INVITE-42"), limit);
            assert!(d.allowed);
            assert_eq!(d.attempts_remaining, expected_remaining);
        }

        let start = f.clock.now();
        let denied = f.limiter.check("203.0.113.5", Some("INVITE-42"), limit);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::RateLimitExceeded));
        assert_eq!(
            denied.retry_after,
            Some(start + chrono::Duration::seconds(60))
        );

        let events = f
            .audit
            .query(&AuditFilter::new().event_type(AuditEventType::RateLimitExceeded))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[0].resource.as_deref(), Some("INVITE-42"));
        assert_eq!(events[0].details["attempt_count"], 6);

        f.clock.advance(Duration::from_secs(61));
        let fresh = f.limiter.check("203.0.113.5", Some("INVITE-42"), limit);
        assert!(fresh.allowed);
        assert_eq!(fresh.attempts_remaining, 4);
    }

    #[test]
    fn test_resources_are_counted_separately() {
        let f = fixture(None);
        let limit = LimitConfig::per_seconds(1, 60).unwrap();

        assert!(f.limiter.check("203.0.113.5", Some("INVITE-1"), limit).allowed);
        assert!(f.limiter.check("203.0.113.5", Some("INVITE-2"), limit).allowed);
        assert!(f.limiter.check("203.0.113.5", None, limit).allowed);
        assert!(!f.limiter.check("203.0.113.5", Some("INVITE-1"), limit).allowed);
    }

    #[test]
    fn test_blocklist_short_circuits_counter() {
        let f = fixture(None);
        f.limiter
            .block("198.51.100.7", "credential stuffing", None, "ops@example.com")
            .unwrap();

        let d = f.limiter.check("198.51.100.7", Some("login"), five_per_minute());
        assert_eq!(d.reason, Some(DenyReason::Blocked));
        assert_eq!(d.retry_after, None);
        assert!(f.limiter.window("198.51.100.7", Some("login")).unwrap().is_none());
        assert!(f.limiter.is_blocked("198.51.100.7"));
    }

    #[test]
    fn test_temporary_block_expires() {
        let f = fixture(None);
        f.limiter
            .block("198.51.100.7", "abuse", Some(Duration::from_secs(600)), "ops")
            .unwrap();

        let d = f.limiter.check("198.51.100.7", None, five_per_minute());
        assert_eq!(
            d.retry_after,
            Some(f.clock.now() + chrono::Duration::seconds(600))
        );

        f.clock.advance(Duration::from_secs(600));
        assert!(!f.limiter.is_blocked("198.51.100.7"));
        assert!(f.limiter.check("198.51.100.7", None, five_per_minute()).allowed);
    }

    #[test]
    fn test_reblock_is_audited_every_time() {
        let f = fixture(None);
        f.limiter.block("10.0.0.1", "abuse", None, "ops").unwrap();
        f.limiter.block("10.0.0.1", "abuse", None, "ops").unwrap();

        let events = f
            .audit
            .query(&AuditFilter::new().event_type(AuditEventType::SubjectBlocked))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].details["previously_blocked"], false);
        assert_eq!(events[1].details["previously_blocked"], true);
    }

    #[test]
    fn test_block_rejects_empty_subject() {
        let f = fixture(None);
        assert_eq!(
            f.limiter.block("", "abuse", None, "ops"),
            Err(SafetyError::Config(ConfigError::EmptyIdentifier("subject")))
        );
    }

    #[test]
    fn test_unblock() {
        let f = fixture(None);
        assert!(!f.limiter.unblock("10.0.0.2", "ops").unwrap());

        f.limiter.block("10.0.0.2", "abuse", None, "ops").unwrap();
        assert!(f.limiter.unblock("10.0.0.2", "oncall").unwrap());
        assert!(!f.limiter.is_blocked("10.0.0.2"));

        let events = f
            .audit
            .query(&AuditFilter::new().event_type(AuditEventType::SubjectUnblocked))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Medium);
        assert_eq!(events[0].details["unblocked_by"], "oncall");
    }

    #[test]
    fn test_auto_block_at_multiplier() {
        let f = fixture(Some(AutoBlockConfig::default()));
        let limit = LimitConfig::per_seconds(2, 60).unwrap();

        // 2 allowed, then denied up to the trigger count of 6
        for _ in 0..5 {
            f.limiter.check("203.0.113.9", None, limit);
        }
        assert!(!f.limiter.is_blocked("203.0.113.9"));

        let sixth = f.limiter.check("203.0.113.9", None, limit);
        assert_eq!(sixth.reason, Some(DenyReason::RateLimitExceeded));

        let entry = f.limiter.blocklist_entry("203.0.113.9").unwrap().unwrap();
        assert_eq!(entry.created_by, AUTO_BLOCK_CREATOR);
        assert_eq!(
            entry.blocked_until,
            Some(f.clock.now() + chrono::Duration::hours(1))
        );

        let next = f.limiter.check("203.0.113.9", None, limit);
        assert_eq!(next.reason, Some(DenyReason::Blocked));

        let events = f
            .audit
            .query(&AuditFilter::new().event_type(AuditEventType::SubjectAutoBlocked))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[test]
    fn test_auto_block_disabled() {
        let f = fixture(None);
        let limit = LimitConfig::per_seconds(1, 60).unwrap();
        for _ in 0..10 {
            f.limiter.check("203.0.113.9", None, limit);
        }
        assert!(!f.limiter.is_blocked("203.0.113.9"));
    }

    #[test]
    fn test_auto_block_config_validation() {
        assert_eq!(
            AutoBlockConfig::new(1, Duration::from_secs(60)),
            Err(ConfigError::AutoBlockMultiplier(1))
        );
        let config: AutoBlockConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AutoBlockConfig::default());
        assert!(serde_json::from_str::<AutoBlockConfig>(r#"{"multiplier": 0}"#).is_err());
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_max() {
        let f = fixture(None);
        let limit = LimitConfig::per_seconds(10, 60).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&f.limiter);
                thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.check("203.0.113.5", Some("INVITE-42"), limit).allowed)
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 10);
        let window = f
            .limiter
            .window("203.0.113.5", Some("INVITE-42"))
            .unwrap()
            .unwrap();
        assert_eq!(window.attempt_count, 80);
    }

    #[test]
    fn test_purge_keeps_active_windows() {
        let f = fixture(None);
        let limit = five_per_minute();
        f.limiter.check("old", None, limit);
        f.limiter
            .block("temp", "abuse", Some(Duration::from_secs(30)), "ops")
            .unwrap();
        f.limiter.block("forever", "abuse", None, "ops").unwrap();

        f.clock.advance(Duration::from_secs(50));
        f.limiter.check("recent", None, limit);

        f.clock.advance(Duration::from_secs(20));
        let report = f.limiter.purge_expired(Duration::ZERO).unwrap();
        assert_eq!(
            report,
            PurgeReport {
                windows_removed: 1,
                blocks_removed: 1,
            }
        );
        assert!(f.limiter.window("old", None).unwrap().is_none());
        assert!(f.limiter.window("recent", None).unwrap().is_some());
        assert!(f.limiter.blocklist_entry("forever").unwrap().is_some());
        assert_eq!(f.metrics.snapshot().windows_purged, 1);
    }

    #[test]
    fn test_purge_respects_retention() {
        let f = fixture(None);
        f.limiter.check("old", None, five_per_minute());
        f.clock.advance(Duration::from_secs(90));

        let report = f.limiter.purge_expired(Duration::from_secs(60)).unwrap();
        assert_eq!(report.windows_removed, 0);

        f.clock.advance(Duration::from_secs(30));
        let report = f.limiter.purge_expired(Duration::from_secs(60)).unwrap();
        assert_eq!(report.windows_removed, 1);
    }

    #[test]
    fn test_store_outage_denies() {
        let metrics = Metrics::new();
        let audit = AuditLog::new(Arc::new(MemoryAuditSink::new()), metrics.clone());
        let limiter = RateLimiter::new(
            UnavailableStorage,
            UnavailableStorage,
            Arc::new(ManualClock::default()),
            audit.clone(),
            metrics.clone(),
            None,
        );

        let d = limiter.check("203.0.113.5", Some("INVITE-42"), five_per_minute());
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(DenyReason::Unavailable));
        assert!(limiter.is_blocked("203.0.113.5"));
        assert!(limiter.block("203.0.113.5", "abuse", None, "ops").is_err());
        assert_eq!(metrics.store_failures(), 2);

        let events = audit
            .query(&AuditFilter::new().event_type(AuditEventType::StoreUnavailable))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details["operation"], "blocklist lookup");
    }
}
