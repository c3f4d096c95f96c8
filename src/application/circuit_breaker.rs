//! Circuit breaker registry.
//!
//! Holds one [`BreakerRecord`] per named operation in a [`Storage`] backend.
//! Every read-evaluate-write runs inside a single `with_entry_mut` call, so
//! concurrent reports for the same name never lose an update and only one
//! caller can take the half-open probe slot.
//!
//! Store failures are answered fail-safe: the breaker is treated as `open`
//! and a `store_unavailable` audit event is recorded.

use crate::application::audit::AuditLog;
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Storage};
use crate::domain::audit::{AuditEvent, AuditEventType};
use crate::domain::breaker::{BreakerConfig, BreakerRecord, BreakerState, Transition};
use crate::error::{ConfigError, SafetyError, StoreError};
use serde_json::json;
use std::sync::Arc;

/// Registry of named circuit breakers.
#[derive(Debug)]
pub struct BreakerRegistry<S>
where
    S: Storage<String, BreakerRecord>,
{
    storage: S,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    metrics: Metrics,
    defaults: BreakerConfig,
}

impl<S> BreakerRegistry<S>
where
    S: Storage<String, BreakerRecord>,
{
    /// Create a registry.
    ///
    /// # Arguments
    /// * `storage` - Backend holding breaker records
    /// * `clock` - Time source for deadlines
    /// * `audit` - Audit trail for state changes
    /// * `metrics` - Shared counters
    /// * `defaults` - Configuration for breakers that were never configured
    pub fn new(
        storage: S,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
        metrics: Metrics,
        defaults: BreakerConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            audit,
            metrics,
            defaults,
        }
    }

    /// Configuration used for implicitly created breakers.
    pub fn defaults(&self) -> BreakerConfig {
        self.defaults
    }

    /// Report the outcome of the guarded operation and return the new state.
    pub fn report(&self, name: &str, success: bool) -> BreakerState {
        self.report_transition(name, success).state
    }

    /// Report an outcome and return the full transition.
    ///
    /// `observed` is the state after the lazy `open -> half_open` step and
    /// before the outcome was applied.
    pub fn report_transition(&self, name: &str, success: bool) -> Transition {
        let now = self.clock.now();
        let defaults = self.defaults;

        let result = self.storage.with_entry_mut(
            name.to_string(),
            || BreakerRecord::new(defaults),
            |record| (record.apply(success, now), record.failure_count),
        );

        let (transition, failure_count) = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.store_failed(name, "report", &err);
                return Transition {
                    observed: BreakerState::Open,
                    state: BreakerState::Open,
                    applied: false,
                };
            }
        };

        if transition.opened() {
            self.metrics.record_breaker_opened();
            tracing::warn!(
                breaker = name,
                failure_count,
                from = transition.observed.as_str(),
                "circuit breaker opened"
            );
            self.audit.record(
                AuditEvent::new(AuditEventType::CircuitOpened, name, now).with_details(json!({
                    "from": transition.observed,
                    "failure_count": failure_count,
                })),
            );
        } else if transition.recovered() {
            tracing::info!(breaker = name, "circuit breaker closed after probe");
            self.audit
                .record(AuditEvent::new(AuditEventType::CircuitClosed, name, now));
        } else if !transition.applied {
            self.metrics.record_breaker_rejection();
            tracing::debug!(
                breaker = name,
                success,
                "outcome rejected while circuit is open"
            );
        }

        transition
    }

    /// Current state, evaluated lazily and without side effects.
    ///
    /// Unknown names read as `closed`.
    pub fn state(&self, name: &str) -> BreakerState {
        match self.storage.get(&name.to_string()) {
            Ok(Some(record)) => record.view(self.clock.now()),
            Ok(None) => BreakerState::Closed,
            Err(err) => {
                self.store_failed(name, "state", &err);
                BreakerState::Open
            }
        }
    }

    /// Pre-flight check before running the guarded operation.
    ///
    /// In `half_open` exactly one caller receives the probe slot; it is
    /// released by the next [`report`](Self::report) for this name, or handed
    /// to the next caller once the recovery timeout passes without a report.
    pub fn try_acquire(&self, name: &str) -> bool {
        let now = self.clock.now();
        let defaults = self.defaults;

        match self.storage.with_entry_mut(
            name.to_string(),
            || BreakerRecord::new(defaults),
            |record| {
                let lost = record.probe_lost(now);
                (record.try_acquire(now), lost)
            },
        ) {
            Ok((true, lost)) => {
                if lost {
                    tracing::warn!(
                        breaker = name,
                        "previous probe never reported, admitting a new probe"
                    );
                }
                true
            }
            Ok((false, _)) => {
                self.metrics.record_breaker_rejection();
                tracing::debug!(breaker = name, "guarded operation refused");
                false
            }
            Err(err) => {
                self.store_failed(name, "try_acquire", &err);
                false
            }
        }
    }

    /// Set threshold and timeout for one breaker.
    ///
    /// The current state is kept; the new timeout applies from the next trip.
    ///
    /// # Errors
    /// Returns a `ConfigError` for an empty name or a zero threshold.
    pub fn configure(&self, name: &str, config: BreakerConfig) -> Result<(), SafetyError> {
        if name.is_empty() {
            return Err(ConfigError::EmptyIdentifier("breaker name").into());
        }
        config.validate()?;

        self.storage.with_entry_mut(
            name.to_string(),
            || BreakerRecord::new(config),
            |record| record.config = config,
        )?;

        tracing::debug!(
            breaker = name,
            threshold = config.threshold,
            timeout_seconds = config.timeout.as_secs(),
            "circuit breaker configured"
        );
        Ok(())
    }

    /// Force a breaker back to `closed`, clearing its counters.
    pub fn reset(&self, name: &str) -> Result<(), SafetyError> {
        let now = self.clock.now();
        let defaults = self.defaults;

        let previous = self.storage.with_entry_mut(
            name.to_string(),
            || BreakerRecord::new(defaults),
            |record| {
                let previous = record.view(now);
                record.reset();
                previous
            },
        )?;

        tracing::info!(breaker = name, from = previous.as_str(), "circuit breaker reset");
        self.audit.record(
            AuditEvent::new(AuditEventType::CircuitReset, name, now)
                .with_details(json!({ "from": previous })),
        );
        Ok(())
    }

    /// Copy of the stored record, if the breaker has ever been used.
    pub fn snapshot(&self, name: &str) -> Result<Option<BreakerRecord>, SafetyError> {
        Ok(self.storage.get(&name.to_string())?)
    }

    fn store_failed(&self, name: &str, operation: &'static str, err: &StoreError) {
        self.metrics.record_store_failure();
        tracing::error!(
            breaker = name,
            operation,
            error = %err,
            "breaker store unavailable, treating circuit as open"
        );
        self.audit.record(
            AuditEvent::new(AuditEventType::StoreUnavailable, name, self.clock.now())
                .with_details(json!({
                    "operation": operation,
                    "error": err.to_string(),
                })),
        );
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
    use std::time::Duration;

    struct Fixture {
        registry: Arc<BreakerRegistry<ShardedStorage<String, BreakerRecord>>>,
        clock: ManualClock,
        audit: AuditLog,
        metrics: Metrics,
    }

    fn fixture(threshold: u32, timeout_secs: u64) -> Fixture {
        let clock = ManualClock::default();
        let metrics = Metrics::new();
        let audit = AuditLog::new(Arc::new(MemoryAuditSink::new()), metrics.clone());
        let registry = BreakerRegistry::new(
            ShardedStorage::new(),
            Arc::new(clock.clone()),
            audit.clone(),
            metrics.clone(),
            BreakerConfig::new(threshold, Duration::from_secs(timeout_secs)).unwrap(),
        );
        Fixture {
            registry: Arc::new(registry),
            clock,
            audit,
            metrics,
        }
    }

    #[test]
    fn test_unknown_breaker_is_closed_with_defaults() {
        let f = fixture(5, 60);
        assert_eq!(f.registry.state("never-seen"), BreakerState::Closed);
        assert!(f.registry.snapshot("never-seen").unwrap().is_none());

        assert_eq!(f.registry.report("never-seen", true), BreakerState::Closed);
        let record = f.registry.snapshot("never-seen").unwrap().unwrap();
        assert_eq!(record.config.threshold, 5);
    }

    #[test]
    fn test_migration_batch_recovers_after_timeout() {
        let f = fixture(3, 60);
        let name = "migration-batch-7";

        assert_eq!(f.registry.report(name, false), BreakerState::Closed);
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.registry.report(name, false), BreakerState::Closed);
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.registry.report(name, false), BreakerState::Open);

        f.clock.advance(Duration::from_secs(30));
        assert_eq!(f.registry.state(name), BreakerState::Open);
        assert!(!f.registry.try_acquire(name));

        f.clock.advance(Duration::from_secs(31));
        assert_eq!(f.registry.state(name), BreakerState::HalfOpen);

        let t = f.registry.report_transition(name, true);
        assert_eq!(t.observed, BreakerState::HalfOpen);
        assert_eq!(t.state, BreakerState::Closed);
        assert_eq!(f.registry.snapshot(name).unwrap().unwrap().failure_count, 0);

        let opened = f
            .audit
            .query(&AuditFilter::new().event_type(AuditEventType::CircuitOpened))
            .unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].severity, Severity::High);
        let closed = f
            .audit
            .query(&AuditFilter::new().event_type(AuditEventType::CircuitClosed))
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].severity, Severity::Medium);
    }

    #[test]
    fn test_open_rejects_outcomes() {
        let f = fixture(1, 60);
        f.registry.report("payments", false);

        let t = f.registry.report_transition("payments", true);
        assert!(!t.applied);
        assert_eq!(t.state, BreakerState::Open);
        assert_eq!(f.metrics.snapshot().breaker_rejections, 1);
    }

    #[test]
    fn test_configure_per_breaker() {
        let f = fixture(5, 60);
        f.registry
            .configure("fragile", BreakerConfig::new(1, Duration::from_secs(5)).unwrap())
            .unwrap();

        assert_eq!(f.registry.report("fragile", false), BreakerState::Open);
        assert_eq!(f.registry.report("sturdy", false), BreakerState::Closed);

        f.clock.advance(Duration::from_secs(5));
        assert_eq!(f.registry.state("fragile"), BreakerState::HalfOpen);
    }

    #[test]
    fn test_configure_rejects_invalid() {
        let f = fixture(5, 60);
        let zero = BreakerConfig {
            threshold: 0,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(
            f.registry.configure("x", zero),
            Err(SafetyError::Config(ConfigError::ZeroThreshold))
        );
        assert_eq!(
            f.registry.configure("", BreakerConfig::default()),
            Err(SafetyError::Config(ConfigError::EmptyIdentifier(
                "breaker name"
            )))
        );
    }

    #[test]
    fn test_reset_closes_and_audits() {
        let f = fixture(1, 60);
        f.registry.report("deploy", false);
        f.registry.reset("deploy").unwrap();

        assert_eq!(f.registry.state("deploy"), BreakerState::Closed);
        let resets = f
            .audit
            .query(&AuditFilter::new().event_type(AuditEventType::CircuitReset))
            .unwrap();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].details["from"], "open");
    }

    #[test]
    fn test_concurrent_probe_admits_exactly_one() {
        let f = fixture(1, 10);
        f.registry.report("probe", false);
        f.clock.advance(Duration::from_secs(10));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&f.registry);
                thread::spawn(move || registry.try_acquire("probe"))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_abandoned_half_open_slot_does_not_wedge_breaker() {
        let f = fixture(1, 10);
        f.registry.report("export", false);
        f.clock.advance(Duration::from_secs(10));
        assert!(f.registry.try_acquire("export"));

        // The holder disappears without reporting
        for _ in 0..9 {
            f.clock.advance(Duration::from_secs(1));
            assert!(!f.registry.try_acquire("export"));
        }
        f.clock.advance(Duration::from_secs(1));
        assert!(f.registry.try_acquire("export"));
        assert!(!f.registry.try_acquire("export"));

        assert_eq!(f.registry.report("export", true), BreakerState::Closed);
        assert!(f.registry.try_acquire("export"));
    }

    #[test]
    fn test_concurrent_failures_count_exactly() {
        let f = fixture(1000, 60);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let registry = Arc::clone(&f.registry);
                thread::spawn(move || {
                    for _ in 0..50 {
                        registry.report("shared", false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = f.registry.snapshot("shared").unwrap().unwrap();
        assert_eq!(record.failure_count, 500);
        assert_eq!(record.state, BreakerState::Closed);
    }

    #[test]
    fn test_store_outage_reads_as_open() {
        let metrics = Metrics::new();
        let audit = AuditLog::new(Arc::new(MemoryAuditSink::new()), metrics.clone());
        let registry = BreakerRegistry::new(
            UnavailableStorage,
            Arc::new(ManualClock::default()),
            audit.clone(),
            metrics.clone(),
            BreakerConfig::default(),
        );

        assert_eq!(registry.report("any", true), BreakerState::Open);
        assert_eq!(registry.state("any"), BreakerState::Open);
        assert!(!registry.try_acquire("any"));
        assert!(registry.reset("any").is_err());
        assert_eq!(metrics.store_failures(), 3);

        let outages = audit
            .query(&AuditFilter::new().event_type(AuditEventType::StoreUnavailable))
            .unwrap();
        let operations: Vec<_> = outages
            .iter()
            .map(|event| event.details["operation"].clone())
            .collect();
        assert_eq!(operations, vec!["report", "state", "try_acquire"]);
        assert!(outages.iter().all(|event| event.subject == "any"));
        assert_eq!(outages[0].severity, Severity::High);
    }
}
