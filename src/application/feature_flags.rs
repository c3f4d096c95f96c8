//! Feature flag engine.
//!
//! Decides whether a gradually rolled-out feature is on for an actor.
//! Decisions for a known actor are deterministic: the same flag, actor and
//! percentage always give the same answer in every process.

use crate::application::audit::AuditLog;
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Storage};
use crate::domain::audit::{AuditEvent, AuditEventType};
use crate::domain::flag::{clamp_percentage, rollout_bucket, FeatureFlag, FULL_ROLLOUT};
use crate::error::{ConfigError, SafetyError};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;

/// Evaluates and administers feature flags.
#[derive(Debug)]
pub struct FlagEngine<S>
where
    S: Storage<String, FeatureFlag>,
{
    storage: S,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    metrics: Metrics,
}

impl<S> FlagEngine<S>
where
    S: Storage<String, FeatureFlag>,
{
    /// Create an engine over `storage`.
    ///
    /// `clock` and `audit` are only used to record store outages.
    pub fn new(storage: S, clock: Arc<dyn Clock>, audit: AuditLog, metrics: Metrics) -> Self {
        Self {
            storage,
            clock,
            audit,
            metrics,
        }
    }

    /// Whether the flag `key` is on for `actor`.
    ///
    /// Unknown flags are off. Without an actor the rollout is applied with a
    /// random draw, so repeated anonymous calls may disagree. A store failure
    /// answers `false` and is audited as `store_unavailable`.
    pub fn decide(&self, key: &str, actor: Option<&str>) -> bool {
        let enabled = match self.storage.get(&key.to_string()) {
            Ok(Some(flag)) => {
                flag.evaluate(actor, || rand::thread_rng().gen_range(0..FULL_ROLLOUT))
            }
            Ok(None) => false,
            Err(err) => {
                self.metrics.record_store_failure();
                tracing::error!(
                    flag = key,
                    error = %err,
                    "flag store unavailable, treating flag as disabled"
                );
                self.audit.record(
                    AuditEvent::new(AuditEventType::StoreUnavailable, key, self.clock.now())
                        .with_details(json!({
                            "operation": "decide",
                            "error": err.to_string(),
                        })),
                );
                false
            }
        };

        self.metrics.record_flag_decision(enabled);
        enabled
    }

    /// Create or replace a flag definition.
    ///
    /// The rollout percentage is clamped to `0..=100`.
    ///
    /// # Errors
    /// Returns `ConfigError::EmptyIdentifier` for an empty key.
    pub fn upsert(&self, mut flag: FeatureFlag) -> Result<(), SafetyError> {
        if flag.key.is_empty() {
            return Err(ConfigError::EmptyIdentifier("flag key").into());
        }
        flag.rollout_percentage = clamp_percentage(i64::from(flag.rollout_percentage));

        tracing::info!(
            flag = %flag.key,
            enabled = flag.enabled,
            rollout_percentage = flag.rollout_percentage,
            "feature flag updated"
        );
        self.storage.insert(flag.key.clone(), flag)?;
        Ok(())
    }

    /// Current definition of a flag.
    pub fn get(&self, key: &str) -> Result<Option<FeatureFlag>, SafetyError> {
        Ok(self.storage.get(&key.to_string())?)
    }

    /// Delete a flag, returning its last definition.
    pub fn remove(&self, key: &str) -> Result<Option<FeatureFlag>, SafetyError> {
        let removed = self.storage.remove(&key.to_string())?;
        if removed.is_some() {
            tracing::info!(flag = key, "feature flag removed");
        }
        Ok(removed)
    }

    /// Rollout bucket of `actor` for `key`, in `0..100`.
    ///
    /// The actor sees the flag (when enabled) iff the bucket is below the
    /// rollout percentage.
    pub fn bucket(&self, key: &str, actor: &str) -> u8 {
        rollout_bucket(key, actor)
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

    fn engine() -> FlagEngine<ShardedStorage<String, FeatureFlag>> {
        let metrics = Metrics::new();
        FlagEngine::new(
            ShardedStorage::new(),
            Arc::new(ManualClock::default()),
            AuditLog::new(Arc::new(MemoryAuditSink::new()), metrics.clone()),
            metrics,
        )
    }

    #[test]
    fn test_unknown_flag_is_off() {
        let engine = engine();
        assert!(!engine.decide("nope", Some("user-1")));
        assert!(!engine.decide("nope", None));
    }

    #[test]
    fn test_seating_ui_rollout_is_stable() {
        let engine = engine();
        engine
            .upsert(FeatureFlag::new("new-seating-ui").enabled(true).with_rollout(25))
            .unwrap();

        let expected = engine.bucket("new-seating-ui", "user-123") < 25;
        for _ in 0..20 {
            assert_eq!(engine.decide("new-seating-ui", Some("user-123")), expected);
        }
    }

    #[test]
    fn test_raising_percentage_only_adds_actors() {
        let engine = engine();
        let actors: Vec<String> = (0..500).map(|i| format!("user-{i}")).collect();

        engine
            .upsert(FeatureFlag::new("checkout-v2").enabled(true).with_rollout(10))
            .unwrap();
        let at_ten: Vec<bool> = actors
            .iter()
            .map(|a| engine.decide("checkout-v2", Some(a)))
            .collect();

        engine
            .upsert(FeatureFlag::new("checkout-v2").enabled(true).with_rollout(60))
            .unwrap();
        for (actor, was_on) in actors.iter().zip(at_ten) {
            if was_on {
                assert!(engine.decide("checkout-v2", Some(actor)));
            }
        }
    }

    #[test]
    fn test_allowlist_and_disabled() {
        let engine = engine();
        engine
            .upsert(
                FeatureFlag::new("beta")
                    .enabled(true)
                    .with_rollout(0)
                    .with_allowlist(["staff-1"]),
            )
            .unwrap();
        assert!(engine.decide("beta", Some("staff-1")));
        assert!(!engine.decide("beta", Some("user-9")));

        engine
            .upsert(
                FeatureFlag::new("beta")
                    .enabled(false)
                    .with_rollout(100)
                    .with_allowlist(["staff-1"]),
            )
            .unwrap();
        assert!(!engine.decide("beta", Some("staff-1")));
    }

    #[test]
    fn test_anonymous_extremes_are_deterministic() {
        let engine = engine();
        engine
            .upsert(FeatureFlag::new("all").enabled(true).with_rollout(100))
            .unwrap();
        engine
            .upsert(FeatureFlag::new("none").enabled(true).with_rollout(0))
            .unwrap();
        for _ in 0..50 {
            assert!(engine.decide("all", None));
            assert!(!engine.decide("none", None));
        }
    }

    #[test]
    fn test_upsert_rejects_empty_key_and_clamps() {
        let engine = engine();
        assert_eq!(
            engine.upsert(FeatureFlag::new("")),
            Err(SafetyError::Config(ConfigError::EmptyIdentifier("flag key")))
        );

        let mut flag = FeatureFlag::new("wide").enabled(true);
        flag.rollout_percentage = 250;
        engine.upsert(flag).unwrap();
        assert_eq!(engine.get("wide").unwrap().unwrap().rollout_percentage, 100);
    }

    #[test]
    fn test_remove() {
        let engine = engine();
        engine.upsert(FeatureFlag::new("temp").enabled(true)).unwrap();
        assert!(engine.remove("temp").unwrap().is_some());
        assert!(engine.remove("temp").unwrap().is_none());
        assert!(engine.get("temp").unwrap().is_none());
    }

    #[test]
    fn test_store_outage_answers_false() {
        let metrics = Metrics::new();
        let clock = ManualClock::default();
        let audit = AuditLog::new(Arc::new(MemoryAuditSink::new()), metrics.clone());
        let engine = FlagEngine::new(
            UnavailableStorage,
            Arc::new(clock.clone()),
            audit.clone(),
            metrics.clone(),
        );

        assert!(!engine.decide("new-seating-ui", Some("user-123")));
        assert_eq!(metrics.store_failures(), 1);
        assert_eq!(metrics.snapshot().flags_disabled, 1);
        assert!(engine.upsert(FeatureFlag::new("x")).is_err());

        let outages = audit
            .query(&AuditFilter::new().event_type(AuditEventType::StoreUnavailable))
            .unwrap();
        assert_eq!(outages.len(), 1);
        assert_eq!(outages[0].subject, "new-seating-ui");
        assert_eq!(outages[0].timestamp, clock.now());
        assert_eq!(outages[0].severity, Severity::High);
        assert_eq!(outages[0].details["operation"], "decide");
    }
}
