//! Control plane facade.
//!
//! Wires the breaker registry, flag engine, rate limiter and audit log onto
//! shared storage, a clock and one metrics instance, and offers a single
//! `admit` call for the common "may this request run, and on which path?"
//! question.
//!
//! ```rust
//! use opguard::{Admission, ControlPlane, GuardRequest, LimitConfig, FeatureFlag};
//!
//! let plane = ControlPlane::builder().build().unwrap();
//! plane
//!     .flags()
//!     .upsert(FeatureFlag::new("new-seating-ui").enabled(true).with_rollout(100))
//!     .unwrap();
//!
//! let request = GuardRequest::new("203.0.113.5", LimitConfig::per_seconds(5, 60).unwrap())
//!     .resource("INVITE-42")
//!     .breaker("redeem-invite")
//!     .flag("new-seating-ui")
//!     .actor("user-123");
//!
//! match plane.admit(&request) {
//!     Admission::Granted { new_path, .. } => {
//!         assert!(new_path);
//!         plane.complete("redeem-invite", true);
//!     }
//!     Admission::Denied { reason, .. } => panic!("denied: {reason}"),
//! }
//! ```

use crate::application::audit::AuditLog;
use crate::application::circuit_breaker::BreakerRegistry;
use crate::application::feature_flags::FlagEngine;
use crate::application::janitor::{JanitorConfig, WindowJanitor};
use crate::application::metrics::Metrics;
use crate::application::ports::{AuditSink, Clock, Storage};
use crate::application::rate_limiter::{AutoBlockConfig, RateLimiter};
use crate::domain::blocklist::BlocklistEntry;
use crate::domain::breaker::{BreakerConfig, BreakerRecord, BreakerState};
use crate::domain::decision::DenyReason;
use crate::domain::flag::FeatureFlag;
use crate::domain::window::{LimitConfig, RateLimitWindow, WindowKey};
use crate::error::ConfigError;
use crate::infrastructure::audit_sink::{MemoryAuditSink, DEFAULT_AUDIT_CAPACITY};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::storage::ShardedStorage;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// The four backends a control plane needs.
#[derive(Debug)]
pub struct Stores<BS, FS, WS, LS> {
    pub breakers: BS,
    pub flags: FS,
    pub windows: WS,
    pub blocklist: LS,
}

/// In-memory stores, one `ShardedStorage` per entity type.
pub type MemoryStores = Stores<
    ShardedStorage<String, BreakerRecord>,
    ShardedStorage<String, FeatureFlag>,
    ShardedStorage<WindowKey, RateLimitWindow>,
    ShardedStorage<String, BlocklistEntry>,
>;

impl Default for MemoryStores {
    fn default() -> Self {
        Self {
            breakers: ShardedStorage::new(),
            flags: ShardedStorage::new(),
            windows: ShardedStorage::new(),
            blocklist: ShardedStorage::new(),
        }
    }
}

/// Builder for constructing a `ControlPlane`.
#[derive(Debug)]
pub struct ControlPlaneBuilder {
    clock: Option<Arc<dyn Clock>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    breaker_defaults: BreakerConfig,
    auto_block: Option<AutoBlockConfig>,
    metrics: Option<Metrics>,
}

impl ControlPlaneBuilder {
    /// Use a custom clock (for tests or simulations).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Configuration for breakers that are never configured explicitly.
    pub fn with_breaker_defaults(mut self, defaults: BreakerConfig) -> Self {
        self.breaker_defaults = defaults;
        self
    }

    /// Escalate heavy rate-limit offenders to the blocklist.
    pub fn with_auto_block(mut self, config: AutoBlockConfig) -> Self {
        self.auto_block = Some(config);
        self
    }

    /// Never block automatically; only `block` adds blocklist entries.
    pub fn without_auto_block(mut self) -> Self {
        self.auto_block = None;
        self
    }

    /// Persist audit events somewhere other than memory.
    ///
    /// Without this the plane keeps the most recent
    /// [`DEFAULT_AUDIT_CAPACITY`] events in a [`MemoryAuditSink`].
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Share an existing metrics instance.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build an in-memory control plane.
    ///
    /// # Errors
    /// Returns a `ConfigError` for a zero breaker threshold or an auto-block
    /// multiplier below 2.
    pub fn build(self) -> Result<ControlPlane, ConfigError> {
        self.build_with_stores(MemoryStores::default())
    }

    /// Build a control plane over custom backends (for example Redis).
    pub fn build_with_stores<BS, FS, WS, LS>(
        self,
        stores: Stores<BS, FS, WS, LS>,
    ) -> Result<ControlPlane<BS, FS, WS, LS>, ConfigError>
    where
        BS: Storage<String, BreakerRecord>,
        FS: Storage<String, FeatureFlag>,
        WS: Storage<WindowKey, RateLimitWindow>,
        LS: Storage<String, BlocklistEntry>,
    {
        self.breaker_defaults.validate()?;
        if let Some(auto_block) = self.auto_block {
            AutoBlockConfig::new(auto_block.multiplier, auto_block.duration)?;
        }

        let metrics = self.metrics.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let sink = self
            .audit_sink
            .unwrap_or_else(|| Arc::new(MemoryAuditSink::bounded(DEFAULT_AUDIT_CAPACITY)));
        let audit = AuditLog::new(sink, metrics.clone());

        let breakers = BreakerRegistry::new(
            stores.breakers,
            Arc::clone(&clock),
            audit.clone(),
            metrics.clone(),
            self.breaker_defaults,
        );
        let flags = FlagEngine::new(
            stores.flags,
            Arc::clone(&clock),
            audit.clone(),
            metrics.clone(),
        );
        let limiter = RateLimiter::new(
            stores.windows,
            stores.blocklist,
            Arc::clone(&clock),
            audit.clone(),
            metrics.clone(),
            self.auto_block,
        );

        Ok(ControlPlane {
            breakers: Arc::new(breakers),
            flags: Arc::new(flags),
            limiter: Arc::new(limiter),
            audit,
            metrics,
        })
    }
}

/// A request to run a guarded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardRequest {
    pub subject: String,
    pub resource: Option<String>,
    pub limit: LimitConfig,
    pub breaker: Option<String>,
    pub flag: Option<String>,
    pub actor: Option<String>,
}

impl GuardRequest {
    /// A request rate-limited by `limit` for `subject`, with no breaker or flag.
    pub fn new(subject: impl Into<String>, limit: LimitConfig) -> Self {
        Self {
            subject: subject.into(),
            resource: None,
            limit,
            breaker: None,
            flag: None,
            actor: None,
        }
    }

    /// Count attempts per resource rather than per subject only.
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Guard the operation with the named breaker.
    pub fn breaker(mut self, name: impl Into<String>) -> Self {
        self.breaker = Some(name.into());
        self
    }

    /// Choose between old and new path with the named flag.
    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.flag = Some(key.into());
        self
    }

    /// Actor used for the flag decision.
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Outcome of [`ControlPlane::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the operation; take the new path when `new_path` is set
    Granted {
        new_path: bool,
        attempts_remaining: u32,
    },
    /// Do not run the operation
    Denied {
        reason: DenyReason,
        retry_after: Option<DateTime<Utc>>,
    },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }
}

/// Operational safety control plane.
#[derive(Debug)]
pub struct ControlPlane<
    BS = ShardedStorage<String, BreakerRecord>,
    FS = ShardedStorage<String, FeatureFlag>,
    WS = ShardedStorage<WindowKey, RateLimitWindow>,
    LS = ShardedStorage<String, BlocklistEntry>,
> where
    BS: Storage<String, BreakerRecord>,
    FS: Storage<String, FeatureFlag>,
    WS: Storage<WindowKey, RateLimitWindow>,
    LS: Storage<String, BlocklistEntry>,
{
    breakers: Arc<BreakerRegistry<BS>>,
    flags: Arc<FlagEngine<FS>>,
    limiter: Arc<RateLimiter<WS, LS>>,
    audit: AuditLog,
    metrics: Metrics,
}

impl<BS, FS, WS, LS> Clone for ControlPlane<BS, FS, WS, LS>
where
    BS: Storage<String, BreakerRecord>,
    FS: Storage<String, FeatureFlag>,
    WS: Storage<WindowKey, RateLimitWindow>,
    LS: Storage<String, BlocklistEntry>,
{
    fn clone(&self) -> Self {
        Self {
            breakers: Arc::clone(&self.breakers),
            flags: Arc::clone(&self.flags),
            limiter: Arc::clone(&self.limiter),
            audit: self.audit.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl ControlPlane {
    /// Create a builder.
    ///
    /// Defaults:
    /// - Clock: system clock
    /// - Audit sink: in memory
    /// - Breakers: threshold 5, recovery timeout 60 seconds
    /// - Auto-block: enabled, multiplier 3, one hour
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder {
            clock: None,
            audit_sink: None,
            breaker_defaults: BreakerConfig::default(),
            auto_block: Some(AutoBlockConfig::default()),
            metrics: None,
        }
    }
}

impl<BS, FS, WS, LS> ControlPlane<BS, FS, WS, LS>
where
    BS: Storage<String, BreakerRecord>,
    FS: Storage<String, FeatureFlag>,
    WS: Storage<WindowKey, RateLimitWindow>,
    LS: Storage<String, BlocklistEntry>,
{
    /// Decide whether a guarded request may run.
    ///
    /// Runs the blocklist and rate limiter first, then takes the breaker's
    /// slot, then evaluates the flag. A granted request that names a breaker
    /// must be followed by [`complete`](Self::complete). The attempt counts
    /// toward the rate limit even when the breaker refuses it.
    pub fn admit(&self, request: &GuardRequest) -> Admission {
        let decision = self.limiter.check(
            &request.subject,
            request.resource.as_deref(),
            request.limit,
        );
        if let Some(reason) = decision.reason {
            return Admission::Denied {
                reason,
                retry_after: decision.retry_after,
            };
        }

        if let Some(name) = &request.breaker {
            if !self.breakers.try_acquire(name) {
                let retry_after = self
                    .breakers
                    .snapshot(name)
                    .ok()
                    .flatten()
                    .and_then(|record| match record.state {
                        BreakerState::Open => record.half_open_deadline,
                        BreakerState::HalfOpen => record.probe_deadline,
                        BreakerState::Closed => None,
                    });
                return Admission::Denied {
                    reason: DenyReason::CircuitOpen,
                    retry_after,
                };
            }
        }

        let new_path = request
            .flag
            .as_deref()
            .map_or(false, |key| self.flags.decide(key, request.actor.as_deref()));

        Admission::Granted {
            new_path,
            attempts_remaining: decision.attempts_remaining,
        }
    }

    /// Report how a granted, breaker-guarded operation ended.
    pub fn complete(&self, breaker: &str, success: bool) -> BreakerState {
        self.breakers.report(breaker, success)
    }

    /// Get the circuit breaker registry.
    pub fn breakers(&self) -> &BreakerRegistry<BS> {
        &self.breakers
    }

    /// Get the feature flag engine.
    pub fn flags(&self) -> &FlagEngine<FS> {
        &self.flags
    }

    /// Get the rate limiter and blocklist.
    pub fn limiter(&self) -> &RateLimiter<WS, LS> {
        &self.limiter
    }

    /// Get the audit log.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Get the shared metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// A janitor purging this control plane's expired windows and blocks.
    pub fn janitor(&self, config: JanitorConfig) -> WindowJanitor<WS, LS> {
        WindowJanitor::new(Arc::clone(&self.limiter), config)
    }
}
