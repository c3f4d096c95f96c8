//! Blocklist entries.

use crate::domain::time::add_duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A subject denied unconditionally until `blocked_until` (or forever).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocklistEntry {
    pub subject: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    /// `None` means the block is permanent
    pub blocked_until: Option<DateTime<Utc>>,
    pub created_by: String,
}

impl BlocklistEntry {
    pub fn new(
        subject: &str,
        reason: &str,
        duration: Option<Duration>,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subject: subject.to_string(),
            reason: reason.to_string(),
            blocked_at: now,
            blocked_until: duration.map(|d| add_duration(now, d)),
            created_by: created_by.to_string(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.blocked_until.is_none()
    }

    /// Whether the entry still blocks its subject at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.map_or(true, |until| until > now)
    }
}
