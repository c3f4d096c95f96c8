//! Error types shared by every primitive.
//!
//! Configuration problems are rejected when the configuration is written.
//! Store problems never reach callers of the decision path: `check`, `decide`
//! and `report` translate them into a deny decision instead.

use thiserror::Error;

/// Invalid configuration, rejected at write time.
///
/// Rollout percentages are the one exception: they are clamped to `0..=100`
/// rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("breaker failure threshold must be at least 1")]
    ZeroThreshold,

    #[error("max attempts must be at least 1")]
    ZeroMaxAttempts,

    #[error("rate limit window must be greater than zero")]
    ZeroWindow,

    #[error("auto-block multiplier must be at least 2, got {0}")]
    AutoBlockMultiplier(u32),

    #[error("purge interval must be greater than zero")]
    ZeroPurgeInterval,

    #[error("{0} must not be empty")]
    EmptyIdentifier(&'static str),
}

/// Failure of the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("stored value could not be decoded: {0}")]
    Codec(String),
}

/// Umbrella error for administrative and read-path operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = SafetyError> = std::result::Result<T, E>;
