//! Audit events.
//!
//! Event types and severities are closed enums so that a typo cannot quietly
//! introduce an untracked category.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Audit severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of safety-relevant events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RateLimitExceeded,
    SubjectBlocked,
    SubjectAutoBlocked,
    SubjectUnblocked,
    CircuitOpened,
    CircuitClosed,
    CircuitReset,
    StoreUnavailable,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
            AuditEventType::SubjectBlocked => "subject_blocked",
            AuditEventType::SubjectAutoBlocked => "subject_auto_blocked",
            AuditEventType::SubjectUnblocked => "subject_unblocked",
            AuditEventType::CircuitOpened => "circuit_opened",
            AuditEventType::CircuitClosed => "circuit_closed",
            AuditEventType::CircuitReset => "circuit_reset",
            AuditEventType::StoreUnavailable => "store_unavailable",
        }
    }

    /// Severity used when the emitter does not pick one explicitly.
    pub fn default_severity(&self) -> Severity {
        match self {
            AuditEventType::SubjectBlocked | AuditEventType::SubjectAutoBlocked => {
                Severity::Critical
            }
            AuditEventType::RateLimitExceeded
            | AuditEventType::CircuitOpened
            | AuditEventType::StoreUnavailable => Severity::High,
            AuditEventType::SubjectUnblocked | AuditEventType::CircuitClosed => Severity::Medium,
            AuditEventType::CircuitReset => Severity::Low,
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub subject: String,
    pub resource: Option<String>,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// New event with the type's default severity and empty details.
    pub fn new(event_type: AuditEventType, subject: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            resource: None,
            event_type,
            severity: event_type.default_severity(),
            details: Value::Object(Default::default()),
            timestamp,
        }
    }

    pub fn with_resource(mut self, resource: Option<&str>) -> Self {
        self.resource = resource.map(str::to_string);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Filters for querying the audit log. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub subject: Option<String>,
    pub resource: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub min_severity: Option<Severity>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of events, keeping the most recent
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes every set filter (ignores `limit`).
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(subject) = &self.subject {
            if &event.subject != subject {
                return false;
            }
        }
        if let Some(resource) = &self.resource {
            if event.resource.as_ref() != Some(resource) {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp >= until {
                return false;
            }
        }
        true
    }
}
