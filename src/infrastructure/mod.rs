//! Infrastructure layer - external adapters and integrations.
//!
//! This layer provides adapters for:
//! - Clock abstraction (system time vs manual)
//! - Storage implementations (sharded maps, Redis)
//! - Audit sinks
//! - The `ControlPlane` facade wiring everything together

pub mod audit_sink;
pub mod clock;
pub mod control_plane;
pub mod storage;

#[cfg(feature = "redis-storage")]
pub mod redis_storage;

/// Mock implementations for testing.
///
/// This module is only available when the `test-helpers` feature is enabled,
/// or during test builds. It provides a capturing `tracing` layer and stores
/// that always fail, for exercising fail-safe behavior.
///
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// opguard = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
