//! Behavior while the backing store is unreachable.
//!
//! Uses a store that can be switched off at runtime to check that every
//! decision fails closed and recovers once the store is back.

use opguard::{
    Admission, AuditEventType, AuditFilter, BreakerState, ControlPlane, DenyReason, FeatureFlag,
    GuardRequest, LimitConfig, ManualClock, MemoryStores, ShardedStorage, Storage, StoreError,
    Stores,
};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct SwitchableStorage<K: Eq + Hash, V> {
    inner: ShardedStorage<K, V>,
    down: Arc<AtomicBool>,
}

impl<K: Eq + Hash, V> SwitchableStorage<K, V> {
    fn new(down: &Arc<AtomicBool>) -> Self {
        Self {
            inner: ShardedStorage::new(),
            down: Arc::clone(down),
        }
    }

    fn available(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection reset".to_string()))
        } else {
            Ok(())
        }
    }
}

impl<K, V> Storage<K, V> for SwitchableStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + Debug,
    V: Clone + Send + Sync + Debug,
{
    fn with_entry_mut<F, R>(
        &self,
        key: K,
        factory: impl Fn() -> V,
        accessor: F,
    ) -> Result<R, StoreError>
    where
        F: FnMut(&mut V) -> R,
    {
        self.available()?;
        self.inner.with_entry_mut(key, factory, accessor)
    }

    fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        self.available()?;
        self.inner.get(key)
    }

    fn insert(&self, key: K, value: V) -> Result<Option<V>, StoreError> {
        self.available()?;
        self.inner.insert(key, value)
    }

    fn remove(&self, key: &K) -> Result<Option<V>, StoreError> {
        self.available()?;
        self.inner.remove(key)
    }

    fn retain<F>(&self, f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.available()?;
        self.inner.retain(f)
    }
}

type FlakyPlane = ControlPlane<
    SwitchableStorage<String, opguard::BreakerRecord>,
    SwitchableStorage<String, FeatureFlag>,
    SwitchableStorage<opguard::WindowKey, opguard::RateLimitWindow>,
    SwitchableStorage<String, opguard::BlocklistEntry>,
>;

fn flaky_plane() -> (FlakyPlane, Arc<AtomicBool>) {
    let down = Arc::new(AtomicBool::new(false));
    let plane = ControlPlane::builder()
        .with_clock(Arc::new(ManualClock::default()))
        .build_with_stores(Stores {
            breakers: SwitchableStorage::new(&down),
            flags: SwitchableStorage::new(&down),
            windows: SwitchableStorage::new(&down),
            blocklist: SwitchableStorage::new(&down),
        })
        .unwrap();
    (plane, down)
}

#[test]
fn test_every_decision_fails_closed() {
    let (plane, down) = flaky_plane();
    plane
        .flags()
        .upsert(FeatureFlag::new("new-checkout").enabled(true).with_rollout(100))
        .unwrap();
    let limit = LimitConfig::per_seconds(5, 60).unwrap();

    down.store(true, Ordering::SeqCst);

    let decision = plane.limiter().check("203.0.113.5", Some("INVITE-42"), limit);
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenyReason::Unavailable));
    assert!(plane.limiter().is_blocked("203.0.113.5"));
    assert!(!plane.flags().decide("new-checkout", Some("user-1")));
    assert_eq!(plane.breakers().state("migration-batch-7"), BreakerState::Open);
    assert!(!plane.breakers().try_acquire("migration-batch-7"));

    // Administrative writes surface the error instead
    assert!(plane.limiter().block("203.0.113.5", "abuse", None, "ops").is_err());
    assert!(plane.breakers().reset("migration-batch-7").is_err());

    let snapshot = plane.metrics().snapshot();
    assert_eq!(snapshot.store_failures, 5);
    assert_eq!(snapshot.checks_denied, 1);
}

#[test]
fn test_outage_is_audited() {
    let (plane, down) = flaky_plane();
    down.store(true, Ordering::SeqCst);

    let limit = LimitConfig::per_seconds(5, 60).unwrap();
    plane.limiter().check("203.0.113.5", None, limit);

    let events = plane
        .audit()
        .query(&AuditFilter::new().event_type(AuditEventType::StoreUnavailable))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject, "203.0.113.5");
    assert_eq!(events[0].details["operation"], "blocklist lookup");
}

#[test]
fn test_flag_and_breaker_outages_are_audited() {
    let (plane, down) = flaky_plane();
    down.store(true, Ordering::SeqCst);

    assert!(!plane.flags().decide("new-checkout", Some("user-1")));
    assert!(!plane.breakers().try_acquire("migration-batch-7"));

    let flag_outages = plane
        .audit()
        .query(
            &AuditFilter::new()
                .event_type(AuditEventType::StoreUnavailable)
                .subject("new-checkout"),
        )
        .unwrap();
    assert_eq!(flag_outages.len(), 1);
    assert_eq!(flag_outages[0].details["operation"], "decide");
    assert_eq!(flag_outages[0].details["error"], "backing store unavailable: connection reset");

    let breaker_outages = plane
        .audit()
        .query(
            &AuditFilter::new()
                .event_type(AuditEventType::StoreUnavailable)
                .subject("migration-batch-7"),
        )
        .unwrap();
    assert_eq!(breaker_outages.len(), 1);
    assert_eq!(breaker_outages[0].details["operation"], "try_acquire");
}

#[test]
fn test_admit_denies_during_outage_and_recovers() {
    let (plane, down) = flaky_plane();
    let request = GuardRequest::new("203.0.113.5", LimitConfig::per_seconds(5, 60).unwrap())
        .breaker("redeem-invite");

    down.store(true, Ordering::SeqCst);
    assert_eq!(
        plane.admit(&request),
        Admission::Denied {
            reason: DenyReason::Unavailable,
            retry_after: None,
        }
    );

    down.store(false, Ordering::SeqCst);
    assert!(plane.admit(&request).is_granted());
    assert_eq!(plane.complete("redeem-invite", true), BreakerState::Closed);
}

#[test]
fn test_memory_stores_build_the_default_plane() {
    let plane = ControlPlane::builder()
        .build_with_stores(MemoryStores::default())
        .unwrap();
    assert!(plane
        .limiter()
        .check("192.0.2.1", None, LimitConfig::per_seconds(1, 1).unwrap())
        .allowed);
}
