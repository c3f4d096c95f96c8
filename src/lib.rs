//! # opguard
//!
//! Operational safety control plane: named circuit breakers, percentage-based
//! feature flag rollouts, and per-subject rate limiting with a blocklist, all
//! leaving an audit trail.
//!
//! The three primitives answer different questions:
//!
//! - **Circuit breakers**: "this operation keeps failing, stop running it for a
//!   while, then let one probe through."
//! - **Feature flags**: "show the new code path to 25% of actors, the same 25%
//!   every time."
//! - **Rate limiter**: "this IP has tried five invitation codes this minute,
//!   deny the sixth."
//!
//! ## Quick Start
//!
//! ```rust
//! use opguard::{Admission, ControlPlane, GuardRequest, LimitConfig};
//!
//! let plane = ControlPlane::builder().build().unwrap();
//!
//! let request = GuardRequest::new("203.0.113.5", LimitConfig::per_seconds(5, 60).unwrap())
//!     .resource("INVITE-42")
//!     .breaker("redeem-invite");
//!
//! if let Admission::Granted { .. } = plane.admit(&request) {
//!     let succeeded = true; // run the operation
//!     plane.complete("redeem-invite", succeeded);
//! }
//! ```
//!
//! Each primitive can also be used on its own through
//! [`ControlPlane::breakers`], [`ControlPlane::flags`] and
//! [`ControlPlane::limiter`].
//!
//! ## Circuit Breakers
//!
//! ```rust
//! # use opguard::{BreakerConfig, BreakerState, ControlPlane};
//! # use std::time::Duration;
//! let plane = ControlPlane::builder().build().unwrap();
//! let breakers = plane.breakers();
//! breakers
//!     .configure("migration-batch-7", BreakerConfig::new(3, Duration::from_secs(60)).unwrap())
//!     .unwrap();
//!
//! for _ in 0..3 {
//!     breakers.report("migration-batch-7", false);
//! }
//! assert_eq!(breakers.state("migration-batch-7"), BreakerState::Open);
//! assert!(!breakers.try_acquire("migration-batch-7"));
//! ```
//!
//! The `open -> half_open` transition is evaluated lazily on access; no timer
//! runs. In `half_open`, `try_acquire` grants exactly one probe.
//!
//! ## Feature Flags
//!
//! ```rust
//! # use opguard::{ControlPlane, FeatureFlag};
//! let plane = ControlPlane::builder().build().unwrap();
//! plane
//!     .flags()
//!     .upsert(FeatureFlag::new("new-seating-ui").enabled(true).with_rollout(25))
//!     .unwrap();
//!
//! let first = plane.flags().decide("new-seating-ui", Some("user-123"));
//! assert_eq!(first, plane.flags().decide("new-seating-ui", Some("user-123")));
//! ```
//!
//! Buckets come from SHA-256 of `key:actor`, so every process agrees and
//! raising the percentage never turns the flag off for anyone. Without an
//! actor the decision is a random draw.
//!
//! ## Rate Limiting and Blocking
//!
//! ```rust
//! # use opguard::{ControlPlane, DenyReason, LimitConfig};
//! let plane = ControlPlane::builder().build().unwrap();
//! let limit = LimitConfig::per_seconds(5, 60).unwrap();
//!
//! for _ in 0..5 {
//!     assert!(plane.limiter().check("203.0.113.5", Some("INVITE-42"), limit).allowed);
//! }
//! let denied = plane.limiter().check("203.0.113.5", Some("INVITE-42"), limit);
//! assert_eq!(denied.reason, Some(DenyReason::RateLimitExceeded));
//! ```
//!
//! The blocklist is checked before any counter. By default a subject reaching
//! three times its limit in one window is blocked for an hour; disable this
//! with [`ControlPlaneBuilder::without_auto_block`].
//!
//! ## Audit Trail
//!
//! Every safety-relevant decision is appended to the audit log and mirrored
//! into `tracing` under the `opguard::audit` target, at a level derived from
//! its severity.
//!
//! ```rust
//! # use opguard::{AuditEventType, AuditFilter, ControlPlane, Severity};
//! let plane = ControlPlane::builder().build().unwrap();
//! plane.limiter().block("198.51.100.7", "credential stuffing", None, "ops").unwrap();
//!
//! let critical = plane
//!     .audit()
//!     .query(&AuditFilter::new().min_severity(Severity::Critical))
//!     .unwrap();
//! assert_eq!(critical[0].event_type, AuditEventType::SubjectBlocked);
//! ```
//!
//! ## Fail-Safe Operation
//!
//! Unlike a logging throttle, this is a security control and fails closed.
//! When the backing store is unreachable, `check` denies with
//! [`DenyReason::Unavailable`], `decide` returns `false`, and breakers read
//! as `open`. Failures are logged with `tracing::error!` and counted in
//! [`Metrics`].
//!
//! ## Storage
//!
//! State lives behind the [`Storage`] port. [`ShardedStorage`] (DashMap) is
//! the default; the `redis-storage` feature adds `RedisStorage` for sharing
//! state across instances, wired in with
//! [`ControlPlaneBuilder::build_with_stores`].
//!
//! ## Features
//!
//! - `async`: background [`WindowJanitor`] task on tokio
//! - `redis-storage`: Redis backend
//! - `test-helpers`: exposes `infrastructure::mocks`

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

pub mod error;

// Re-export commonly used types for convenience
pub use domain::{
    audit::{AuditEvent, AuditEventType, AuditFilter, Severity},
    blocklist::BlocklistEntry,
    breaker::{BreakerConfig, BreakerRecord, BreakerState, Transition},
    decision::{Decision, DenyReason},
    flag::{rollout_bucket, FeatureFlag},
    window::{LimitConfig, RateLimitWindow, WindowKey},
};

pub use application::{
    audit::{AuditLog, AUDIT_TARGET},
    circuit_breaker::BreakerRegistry,
    feature_flags::FlagEngine,
    janitor::{JanitorConfig, WindowJanitor},
    metrics::{Metrics, MetricsSnapshot},
    ports::{AuditSink, Clock, Storage},
    rate_limiter::{AutoBlockConfig, PurgeReport, RateLimiter},
};

#[cfg(feature = "async")]
pub use application::janitor::{JanitorHandle, ShutdownError};

pub use error::{ConfigError, SafetyError, StoreError};

pub use infrastructure::{
    audit_sink::{MemoryAuditSink, DEFAULT_AUDIT_CAPACITY},
    clock::{ManualClock, SystemClock},
    control_plane::{Admission, ControlPlane, ControlPlaneBuilder, GuardRequest, MemoryStores, Stores},
    storage::ShardedStorage,
};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_storage::{RedisStorage, RedisStorageConfig};
