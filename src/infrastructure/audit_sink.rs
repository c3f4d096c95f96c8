//! In-memory audit sink.

use crate::application::ports::AuditSink;
use crate::domain::audit::{AuditEvent, AuditFilter};
use crate::error::StoreError;
use std::collections::VecDeque;
use std::sync::RwLock;

/// Capacity of the sink the control plane builder installs by default.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Audit sink keeping events in memory, in append order.
///
/// Suitable for tests and single-process deployments that ship events
/// elsewhere through the mirrored `tracing` output. A bounded sink drops its
/// oldest event once full; deployments that must retain the whole trail
/// should install a durable sink through `with_audit_sink`.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: RwLock<VecDeque<AuditEvent>>,
    capacity: Option<usize>,
}

impl MemoryAuditSink {
    /// Unbounded sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink holding at most `capacity` events, never fewer than one.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            capacity: Some(capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.read().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("audit sink lock poisoned".to_string())
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, event: AuditEvent) -> Result<(), StoreError> {
        let mut events = self.events.write().map_err(poisoned)?;
        if let Some(capacity) = self.capacity {
            while events.len() >= capacity {
                events.pop_front();
            }
        }
        events.push_back(event);
        Ok(())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError> {
        let events = self.events.read().map_err(poisoned)?;
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        Ok(matched)
    }
}
