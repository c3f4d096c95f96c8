//! Store doubles that always fail, for exercising fail-safe paths.

use crate::application::ports::{AuditSink, Storage};
use crate::domain::audit::{AuditEvent, AuditFilter};
use crate::error::StoreError;
use std::hash::Hash;

fn outage() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

/// Storage whose every operation fails with `StoreError::Unavailable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableStorage;

impl<K, V> Storage<K, V> for UnavailableStorage
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn with_entry_mut<F, R>(
        &self,
        _key: K,
        _factory: impl Fn() -> V,
        _accessor: F,
    ) -> Result<R, StoreError>
    where
        F: FnMut(&mut V) -> R,
    {
        Err(outage())
    }

    fn get(&self, _key: &K) -> Result<Option<V>, StoreError> {
        Err(outage())
    }

    fn insert(&self, _key: K, _value: V) -> Result<Option<V>, StoreError> {
        Err(outage())
    }

    fn remove(&self, _key: &K) -> Result<Option<V>, StoreError> {
        Err(outage())
    }

    fn retain<F>(&self, _f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&K, &V) -> bool,
    {
        Err(outage())
    }
}

/// Audit sink that rejects every write and query.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableAuditSink;

impl AuditSink for UnavailableAuditSink {
    fn append(&self, _event: AuditEvent) -> Result<(), StoreError> {
        Err(outage())
    }

    fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError> {
        Err(outage())
    }
}
