//! In-memory storage for control plane state.
//!
//! Provides concurrent, sharded storage for breaker records, flags, windows
//! and blocklist entries.

use crate::application::ports::Storage;
use crate::error::StoreError;
use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Thread-safe sharded storage backed by DashMap.
///
/// `with_entry_mut` runs the accessor while holding the shard's write lock,
/// which gives atomic check-and-increment within one process. State is lost
/// on restart; use the Redis backend when several processes share limits.
#[derive(Debug)]
pub struct ShardedStorage<K, V>
where
    K: Eq + Hash,
{
    map: DashMap<K, V>,
}

impl<K, V> ShardedStorage<K, V>
where
    K: Eq + Hash,
{
    /// Create a new sharded storage instance.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.map.clear();
    }
}

impl<K, V> Default for ShardedStorage<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Storage<K, V> for ShardedStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + Debug,
    V: Clone + Send + Sync + Debug,
{
    fn with_entry_mut<F, R>(
        &self,
        key: K,
        factory: impl Fn() -> V,
        mut accessor: F,
    ) -> Result<R, StoreError>
    where
        F: FnMut(&mut V) -> R,
    {
        let mut value = self.map.entry(key).or_insert_with(factory);
        Ok(accessor(&mut value))
    }

    fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        Ok(self.map.get(key).map(|entry| entry.value().clone()))
    }

    fn insert(&self, key: K, value: V) -> Result<Option<V>, StoreError> {
        Ok(self.map.insert(key, value))
    }

    fn remove(&self, key: &K) -> Result<Option<V>, StoreError> {
        Ok(self.map.remove(key).map(|(_, value)| value))
    }

    fn retain<F>(&self, mut f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = 0;
        self.map.retain(|key, value| {
            let keep = f(key, value);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}
