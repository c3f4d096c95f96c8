//! Redis-backed storage implementation.
//!
//! Provides a shared storage backend using Redis, so limits, breakers, flags
//! and blocks are enforced consistently across application instances.
//!
//! ## Architecture
//!
//! - Keys: `{key_prefix}{key}` using the key's `Display` form
//! - Values: bincode-encoded `(key, value)` pairs, so `retain` can recover
//!   the typed key from a scanned entry
//! - TTL: optional expiry refreshed on every write (useful for windows,
//!   never set it for breakers, flags or blocks)
//!
//! ## Atomicity
//!
//! Every read-modify-write runs in an optimistic `WATCH`/`MULTI`/`EXEC`
//! loop. If another writer touches the key in between, `EXEC` aborts and the
//! closure runs again against the fresh value, which is why the `Storage`
//! port requires `factory` and `accessor` to be re-runnable.
//!
//! ## Error Handling
//!
//! Connection and protocol failures surface as `StoreError::Unavailable`;
//! undecodable values as `StoreError::Codec`. The services above turn both
//! into deny decisions.
//!
//! ## Example
//!
//! ```rust,ignore
//! use opguard::infrastructure::redis_storage::{RedisStorage, RedisStorageConfig};
//! use opguard::domain::window::{RateLimitWindow, WindowKey};
//! use std::time::Duration;
//!
//! let windows: RedisStorage<WindowKey, RateLimitWindow> = RedisStorage::open(
//!     "redis://127.0.0.1/",
//!     RedisStorageConfig::namespace("opguard:window:").with_ttl(Duration::from_secs(3600)),
//! )?;
//! ```

use crate::application::ports::Storage;
use crate::domain::time::option_duration_secs;
use crate::error::StoreError;
use redis::{Client, Commands, Connection, RedisError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "opguard:";

/// Keys examined per `SCAN` round trip.
const SCAN_BATCH: usize = 100;

/// Configuration for Redis storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisStorageConfig {
    /// Prefix for every key written by this store (default: "opguard:")
    pub key_prefix: String,
    /// Expiry applied on each write, `None` to keep entries until removed
    #[serde(rename = "ttl_seconds", with = "option_duration_secs", default)]
    pub ttl: Option<Duration>,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: None,
        }
    }
}

impl RedisStorageConfig {
    /// Config with its own key prefix and no TTL.
    ///
    /// Give each entity type a distinct prefix; `retain` scans by prefix.
    pub fn namespace(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            ttl: None,
        }
    }

    /// Expire entries `ttl` after their last write.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Redis-backed storage for shared control plane state.
pub struct RedisStorage<K, V> {
    connection: Arc<Mutex<Connection>>,
    config: RedisStorageConfig,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> fmt::Debug for RedisStorage<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<K, V> Clone for RedisStorage<K, V> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            config: self.config.clone(),
            _marker: PhantomData,
        }
    }
}

/// What a transaction does with the entry after inspecting it.
enum Write<V> {
    Put(V),
    Delete,
    Keep,
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

impl<K, V> RedisStorage<K, V>
where
    K: Display + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    /// * `config` - Key prefix and TTL
    ///
    /// # Errors
    /// Returns `StoreError::Unavailable` if the connection fails.
    pub fn open(url: &str, config: RedisStorageConfig) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        let connection = client.get_connection().map_err(unavailable)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            config,
            _marker: PhantomData,
        })
    }

    /// Get the storage configuration.
    pub fn config(&self) -> &RedisStorageConfig {
        &self.config
    }

    fn redis_key(&self, key: &K) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.connection
            .lock()
            .map_err(|_| StoreError::Unavailable("redis connection lock poisoned".to_string()))
    }

    fn encode(key: &K, value: &V) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(&(key, value)).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<(K, V), StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Run `decide` against the current value of `redis_key` and apply its
    /// write atomically, retrying on concurrent modification.
    fn transact<R>(
        &self,
        conn: &mut Connection,
        key: &K,
        redis_key: &str,
        mut decide: impl FnMut(Option<V>) -> Result<(Write<V>, R), StoreError>,
    ) -> Result<R, StoreError> {
        let ttl = self.config.ttl.map(|ttl| ttl.as_secs().max(1));

        let outcome = redis::transaction(conn, &[redis_key], |conn, pipe| {
            let current: Option<Vec<u8>> = conn.get(redis_key)?;
            let current = match current.as_deref().map(Self::decode).transpose() {
                Ok(decoded) => decoded.map(|(_, value)| value),
                Err(err) => return Ok(Some(Err(err))),
            };

            let (write, result) = match decide(current) {
                Ok(decided) => decided,
                Err(err) => return Ok(Some(Err(err))),
            };

            match write {
                Write::Keep => return Ok(Some(Ok(result))),
                Write::Delete => {
                    pipe.del(redis_key).ignore();
                }
                Write::Put(value) => {
                    let bytes = match Self::encode(key, &value) {
                        Ok(bytes) => bytes,
                        Err(err) => return Ok(Some(Err(err))),
                    };
                    match ttl {
                        Some(secs) => pipe.set_ex(redis_key, bytes, secs).ignore(),
                        None => pipe.set(redis_key, bytes).ignore(),
                    };
                }
            }

            let committed: Option<()> = pipe.query(conn)?;
            Ok(committed.map(|()| Ok(result)))
        })
        .map_err(unavailable)?;

        outcome
    }

    fn scan_keys(&self, conn: &mut Connection) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", self.config.key_prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query(conn)
                .map_err(unavailable)?;
            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

impl<K, V> Storage<K, V> for RedisStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + Display + Serialize + DeserializeOwned,
    V: Clone + Send + Sync + Serialize + DeserializeOwned,
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
        let redis_key = self.redis_key(&key);
        let mut conn = self.lock()?;

        self.transact(&mut conn, &key, &redis_key, |current| {
            let mut value = current.unwrap_or_else(&factory);
            let result = accessor(&mut value);
            Ok((Write::Put(value), result))
        })
    }

    fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.lock()?;

        let bytes: Option<Vec<u8>> = conn.get(&redis_key).map_err(unavailable)?;
        bytes
            .as_deref()
            .map(Self::decode)
            .transpose()
            .map(|decoded| decoded.map(|(_, value)| value))
    }

    fn insert(&self, key: K, value: V) -> Result<Option<V>, StoreError> {
        let redis_key = self.redis_key(&key);
        let mut conn = self.lock()?;

        self.transact(&mut conn, &key, &redis_key, |previous| {
            Ok((Write::Put(value.clone()), previous))
        })
    }

    fn remove(&self, key: &K) -> Result<Option<V>, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.lock()?;

        self.transact(&mut conn, key, &redis_key, |previous| match previous {
            Some(value) => Ok((Write::Delete, Some(value))),
            None => Ok((Write::Keep, None)),
        })
    }

    fn retain<F>(&self, mut f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut conn = self.lock()?;
        let mut removed = 0;

        for redis_key in self.scan_keys(&mut conn)? {
            let bytes: Option<Vec<u8>> = conn.get(&redis_key).map_err(unavailable)?;
            let Some(bytes) = bytes else { continue };
            let (key, _) = match Self::decode(&bytes) {
                Ok(decoded) => decoded,
                Err(err) => {
                    tracing::warn!(key = %redis_key, error = %err, "skipping undecodable entry");
                    continue;
                }
            };

            // Re-evaluated under WATCH so an entry updated after the scan is judged on its new value.
            let dropped = self.transact(&mut conn, &key, &redis_key, |current| {
                Ok(match current {
                    Some(value) if !f(&key, &value) => (Write::Delete, true),
                    _ => (Write::Keep, false),
                })
            })?;
            if dropped {
                removed += 1;
            }
        }

        Ok(removed)
    }
}
