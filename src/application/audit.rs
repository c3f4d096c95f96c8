//! Audit log service.
//!
//! Every safety-relevant event is written to the [`AuditSink`] and mirrored
//! into `tracing` under the [`AUDIT_TARGET`] target, so operators see it even
//! when the sink is down.

use crate::application::metrics::Metrics;
use crate::application::ports::AuditSink;
use crate::domain::audit::{AuditEvent, AuditFilter, Severity};
use crate::error::SafetyError;
use std::sync::Arc;

/// `tracing` target used for mirrored audit events.
pub const AUDIT_TARGET: &str = "opguard::audit";

/// Append-only audit trail shared by all primitives.
#[derive(Debug, Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    metrics: Metrics,
}

impl AuditLog {
    /// Create an audit log writing to `sink`.
    pub fn new(sink: Arc<dyn AuditSink>, metrics: Metrics) -> Self {
        Self { sink, metrics }
    }

    /// Record an event.
    ///
    /// Never fails: a sink error is logged and counted, and the decision that
    /// produced the event stands.
    pub fn record(&self, event: AuditEvent) {
        mirror(&event);

        let event_type = event.event_type;
        if let Err(err) = self.sink.append(event) {
            self.metrics.record_audit_failure();
            tracing::error!(
                target: AUDIT_TARGET,
                event_type = event_type.as_str(),
                error = %err,
                "failed to persist audit event"
            );
        }
    }

    /// Query recorded events, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, SafetyError> {
        Ok(self.sink.query(filter)?)
    }
}

fn mirror(event: &AuditEvent) {
    let resource = event.resource.as_deref().unwrap_or("");
    macro_rules! emit {
        ($level:ident) => {
            tracing::$level!(
                target: AUDIT_TARGET,
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                severity = event.severity.as_str(),
                subject = %event.subject,
                resource,
                details = %event.details,
                "audit event"
            )
        };
    }

    match event.severity {
        Severity::Low => emit!(debug),
        Severity::Medium => emit!(info),
        Severity::High => emit!(warn),
        Severity::Critical => emit!(error),
    }
}
