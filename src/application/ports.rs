//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::audit::{AuditEvent, AuditFilter};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::hash::Hash;

/// Port for obtaining current time.
///
/// Infrastructure provides concrete implementations (SystemClock, ManualClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Port for the keyed state store behind every primitive.
///
/// The one primitive the control plane depends on is
/// [`with_entry_mut`](Storage::with_entry_mut): an atomic "insert or update,
/// return the accessor's result" on a single key. Rate-limit counters and
/// breaker transitions are both expressed through it, never as a separate
/// read followed by a write.
///
/// Every method is fallible. Services translate errors into fail-safe
/// decisions; they never panic on a store failure.
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Atomically access an entry with mutable access, creating it if necessary.
    ///
    /// Backends that use optimistic concurrency may call `factory` and
    /// `accessor` more than once; both must be pure functions of the stored
    /// value. Only the result of the attempt that committed is returned.
    ///
    /// # Arguments
    /// * `key` - The key to look up
    /// * `factory` - Builds the initial value when the key is absent
    /// * `accessor` - Mutates the value and produces the result
    fn with_entry_mut<F, R>(
        &self,
        key: K,
        factory: impl Fn() -> V,
        accessor: F,
    ) -> Result<R, StoreError>
    where
        F: FnMut(&mut V) -> R;

    /// Get a copy of the value stored under `key`.
    fn get(&self, key: &K) -> Result<Option<V>, StoreError>;

    /// Insert or replace a value, returning the previous one.
    fn insert(&self, key: K, value: V) -> Result<Option<V>, StoreError>;

    /// Remove a value, returning it if it existed.
    fn remove(&self, key: &K) -> Result<Option<V>, StoreError>;

    /// Remove entries for which the predicate returns false.
    ///
    /// Returns the number of entries removed. Backends must not remove an
    /// entry that was updated after the predicate saw it.
    fn retain<F>(&self, f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&K, &V) -> bool;
}

/// Port for the append-only audit trail.
pub trait AuditSink: Send + Sync + Debug {
    /// Append one event. Events are never updated or deleted through this port.
    fn append(&self, event: AuditEvent) -> Result<(), StoreError>;

    /// Events matching `filter`, oldest first.
    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError>;
}

impl<K, V, T> Storage<K, V> for std::sync::Arc<T>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
    T: Storage<K, V>,
{
    fn with_entry_mut<F, R>(
        &self,
        key: K,
        factory: impl Fn() -> V,
        accessor: F,
    ) -> Result<R, StoreError>
    where
        F: FnMut(&mut V) -> R,
    {
        (**self).with_entry_mut(key, factory, accessor)
    }

    fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        (**self).get(key)
    }

    fn insert(&self, key: K, value: V) -> Result<Option<V>, StoreError> {
        (**self).insert(key, value)
    }

    fn remove(&self, key: &K) -> Result<Option<V>, StoreError> {
        (**self).remove(key)
    }

    fn retain<F>(&self, f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&K, &V) -> bool,
    {
        (**self).retain(f)
    }
}
