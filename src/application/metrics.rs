//! Observability metrics for the control plane.
//!
//! Provides counters about decisions and store health for monitoring and debugging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking control plane statistics.
///
/// All metrics use atomic operations for thread-safe updates and reads.
/// Clones share the same counters, so one instance can be handed to every
/// primitive and read from a health check.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Rate-limit checks that were allowed
    checks_allowed: AtomicU64,
    /// Rate-limit checks that were denied (blocked, exceeded or unavailable)
    checks_denied: AtomicU64,
    /// Blocklist upserts, manual and automatic
    subjects_blocked: AtomicU64,
    /// Breaker transitions into `open`
    breakers_opened: AtomicU64,
    /// Guarded operations refused by an open or probing breaker
    breaker_rejections: AtomicU64,
    /// Feature flag decisions that came out enabled
    flags_enabled: AtomicU64,
    /// Feature flag decisions that came out disabled
    flags_disabled: AtomicU64,
    /// Store operations that failed and were answered fail-safe
    store_failures: AtomicU64,
    /// Audit events that could not be written
    audit_failures: AtomicU64,
    /// Rate-limit windows removed by purges
    windows_purged: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub(crate) fn record_check(&self, allowed: bool) {
        let counter = if allowed {
            &self.inner.checks_allowed
        } else {
            &self.inner.checks_denied
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_block(&self) {
        self.inner.subjects_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_breaker_opened(&self) {
        self.inner.breakers_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_breaker_rejection(&self) {
        self.inner
            .breaker_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flag_decision(&self, enabled: bool) {
        let counter = if enabled {
            &self.inner.flags_enabled
        } else {
            &self.inner.flags_disabled
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_failure(&self) {
        self.inner.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_audit_failure(&self) {
        self.inner.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_windows_purged(&self, count: usize) {
        self.inner
            .windows_purged
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get the number of allowed rate-limit checks.
    pub fn checks_allowed(&self) -> u64 {
        self.inner.checks_allowed.load(Ordering::Relaxed)
    }

    /// Get the number of denied rate-limit checks.
    pub fn checks_denied(&self) -> u64 {
        self.inner.checks_denied.load(Ordering::Relaxed)
    }

    /// Get the number of failed store operations.
    pub fn store_failures(&self) -> u64 {
        self.inner.store_failures.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            checks_allowed: load(&self.inner.checks_allowed),
            checks_denied: load(&self.inner.checks_denied),
            subjects_blocked: load(&self.inner.subjects_blocked),
            breakers_opened: load(&self.inner.breakers_opened),
            breaker_rejections: load(&self.inner.breaker_rejections),
            flags_enabled: load(&self.inner.flags_enabled),
            flags_disabled: load(&self.inner.flags_disabled),
            store_failures: load(&self.inner.store_failures),
            audit_failures: load(&self.inner.audit_failures),
            windows_purged: load(&self.inner.windows_purged),
        }
    }

    /// Reset all metrics to zero.
    ///
    /// Useful for testing or when starting a new monitoring period.
    pub fn reset(&self) {
        for counter in [
            &self.inner.checks_allowed,
            &self.inner.checks_denied,
            &self.inner.subjects_blocked,
            &self.inner.breakers_opened,
            &self.inner.breaker_rejections,
            &self.inner.flags_enabled,
            &self.inner.flags_disabled,
            &self.inner.store_failures,
            &self.inner.audit_failures,
            &self.inner.windows_purged,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub checks_allowed: u64,
    pub checks_denied: u64,
    pub subjects_blocked: u64,
    pub breakers_opened: u64,
    pub breaker_rejections: u64,
    pub flags_enabled: u64,
    pub flags_disabled: u64,
    pub store_failures: u64,
    pub audit_failures: u64,
    pub windows_purged: u64,
}

impl MetricsSnapshot {
    /// Total rate-limit checks.
    pub fn total_checks(&self) -> u64 {
        self.checks_allowed.saturating_add(self.checks_denied)
    }

    /// Ratio of denied checks to all checks (0.0 to 1.0).
    ///
    /// Returns 0.0 if no checks have been made.
    pub fn denial_rate(&self) -> f64 {
        let total = self.total_checks();
        if total == 0 {
            0.0
        } else {
            self.checks_denied as f64 / total as f64
        }
    }
}
