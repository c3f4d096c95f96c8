//! Periodic cleanup of expired rate-limit state.
//!
//! Windows and blocklist entries are removed lazily only by
//! [`RateLimiter::purge_expired`]; the janitor calls it on an interval so the
//! store does not grow with every subject ever seen.

use crate::application::ports::Storage;
use crate::application::rate_limiter::{PurgeReport, RateLimiter};
use crate::domain::blocklist::BlocklistEntry;
use crate::domain::window::{RateLimitWindow, WindowKey};
use crate::error::{ConfigError, SafetyError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "async")]
use tokio::sync::oneshot;
#[cfg(feature = "async")]
use tokio::task::JoinHandle;
#[cfg(feature = "async")]
use tokio::time::{interval, MissedTickBehavior};

/// Default time between purge passes.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Default time an ended window is kept before it may be purged.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Configuration for the window janitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawJanitorConfig")]
pub struct JanitorConfig {
    /// How often to purge
    #[serde(rename = "interval_seconds", with = "crate::domain::time::duration_secs")]
    pub interval: Duration,
    /// How long ended windows are retained
    #[serde(rename = "retention_seconds", with = "crate::domain::time::duration_secs")]
    pub retention: Duration,
}

#[derive(Deserialize)]
struct RawJanitorConfig {
    #[serde(default = "default_interval_secs")]
    interval_seconds: u64,
    #[serde(default = "default_retention_secs")]
    retention_seconds: u64,
}

fn default_interval_secs() -> u64 {
    DEFAULT_PURGE_INTERVAL.as_secs()
}

fn default_retention_secs() -> u64 {
    DEFAULT_RETENTION.as_secs()
}

impl TryFrom<RawJanitorConfig> for JanitorConfig {
    type Error = ConfigError;

    fn try_from(raw: RawJanitorConfig) -> Result<Self, Self::Error> {
        JanitorConfig::new(
            Duration::from_secs(raw.interval_seconds),
            Duration::from_secs(raw.retention_seconds),
        )
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PURGE_INTERVAL,
            retention: DEFAULT_RETENTION,
        }
    }
}

impl JanitorConfig {
    /// Create a janitor config.
    ///
    /// # Errors
    /// Returns `ConfigError::ZeroPurgeInterval` if `interval` is zero.
    pub fn new(interval: Duration, retention: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroPurgeInterval);
        }
        Ok(Self {
            interval,
            retention,
        })
    }
}

/// Purges expired windows and blocklist entries.
pub struct WindowJanitor<W, B>
where
    W: Storage<WindowKey, RateLimitWindow>,
    B: Storage<String, BlocklistEntry>,
{
    limiter: Arc<RateLimiter<W, B>>,
    config: JanitorConfig,
}

impl<W, B> WindowJanitor<W, B>
where
    W: Storage<WindowKey, RateLimitWindow>,
    B: Storage<String, BlocklistEntry>,
{
    /// Create a janitor for `limiter`.
    pub fn new(limiter: Arc<RateLimiter<W, B>>, config: JanitorConfig) -> Self {
        Self { limiter, config }
    }

    /// Run one purge pass.
    pub fn run_once(&self) -> Result<PurgeReport, SafetyError> {
        self.limiter.purge_expired(self.config.retention)
    }

    /// Get the janitor configuration.
    pub fn config(&self) -> &JanitorConfig {
        &self.config
    }

    /// Start purging periodically in a background task.
    ///
    /// Failed passes are logged and retried on the next tick. Dropping the
    /// returned handle stops the task as well.
    #[cfg(feature = "async")]
    pub fn start(self) -> JanitorHandle
    where
        W: 'static,
        B: 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once() {
                            tracing::warn!(error = %e, "window purge failed");
                        }
                    }
                }
            }
        });

        JanitorHandle {
            task,
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

/// Error returned when the janitor task did not stop cleanly.
#[cfg(feature = "async")]
#[derive(Debug, thiserror::Error)]
#[error("janitor task failed: {0}")]
pub struct ShutdownError(#[from] tokio::task::JoinError);

/// Handle to a running janitor task.
#[cfg(feature = "async")]
#[derive(Debug)]
pub struct JanitorHandle {
    task: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[cfg(feature = "async")]
impl JanitorHandle {
    /// Stop the janitor and wait for the current pass to finish.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task.await?;
        Ok(())
    }

    /// Whether the background task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
