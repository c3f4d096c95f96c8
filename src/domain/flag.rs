//! Feature flags with percentage-based rollout.
//!
//! Rollout decisions are deterministic per `(flag key, actor)`: the actor is
//! hashed into a bucket in `0..100` and lands on the enabled side when the
//! bucket is below the rollout percentage. Because the bucket never changes,
//! raising the percentage only ever moves actors from disabled to enabled.

use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Upper bound for rollout percentages.
pub const FULL_ROLLOUT: u8 = 100;

/// Compute the stable rollout bucket (`0..100`) for an actor.
///
/// The bucket is the first four bytes of `SHA-256(key ":" actor)`, read
/// big-endian, modulo 100. SHA-256 is used instead of a fast in-process
/// hasher so that buckets agree across processes, hosts and releases.
pub fn rollout_bucket(key: &str, actor: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b":");
    hasher.update(actor.as_bytes());
    let digest = hasher.finalize();

    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix % 100) as u8
}

/// Clamp an arbitrary percentage into `0..=100`.
pub fn clamp_percentage(percentage: i64) -> u8 {
    percentage.clamp(0, i64::from(FULL_ROLLOUT)) as u8
}

// Written as i64 so that the binary codec reads back the same width it wrote.
fn serialize_percentage<S>(percentage: &u8, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_i64(i64::from(*percentage))
}

fn deserialize_percentage<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    i64::deserialize(deserializer).map(clamp_percentage)
}

// Binary codecs cannot decode arbitrary JSON, so non human-readable formats
// carry the metadata object as a JSON string.
fn serialize_metadata<S>(metadata: &Map<String, Value>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if serializer.is_human_readable() {
        metadata.serialize(serializer)
    } else {
        let encoded =
            serde_json::to_string(metadata).map_err(<S::Error as ser::Error>::custom)?;
        serializer.serialize_str(&encoded)
    }
}

fn deserialize_metadata<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        Map::deserialize(deserializer)
    } else {
        let encoded = String::deserialize(deserializer)?;
        serde_json::from_str(&encoded).map_err(<D::Error as de::Error>::custom)
    }
}

/// A feature flag definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    pub enabled: bool,
    /// Share of actors that see the flag enabled, `0..=100`
    #[serde(
        serialize_with = "serialize_percentage",
        deserialize_with = "deserialize_percentage"
    )]
    pub rollout_percentage: u8,
    /// Actors that see the flag whenever it is enabled, regardless of rollout
    #[serde(default)]
    pub allowlist: BTreeSet<String>,
    /// Free-form JSON annotations (owner, ticket, rollout plan)
    #[serde(
        default,
        serialize_with = "serialize_metadata",
        deserialize_with = "deserialize_metadata"
    )]
    pub metadata: Map<String, Value>,
}

impl FeatureFlag {
    /// Create a disabled flag at 0% rollout.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            enabled: false,
            rollout_percentage: 0,
            allowlist: BTreeSet::new(),
            metadata: Map::new(),
        }
    }

    /// Enable or disable the flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the rollout percentage, clamped to `0..=100`.
    pub fn with_rollout(mut self, percentage: i64) -> Self {
        self.rollout_percentage = clamp_percentage(percentage);
        self
    }

    /// Add actors that always see the flag while it is enabled.
    pub fn with_allowlist<I, S>(mut self, actors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowlist.extend(actors.into_iter().map(Into::into));
        self
    }

    /// Attach a metadata annotation.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Decide whether the flag is on for `actor`.
    ///
    /// Without an actor there is nothing stable to hash, so `draw` supplies a
    /// bucket instead; the engine passes a random draw.
    pub fn evaluate(&self, actor: Option<&str>, draw: impl FnOnce() -> u8) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(actor) = actor {
            if self.allowlist.contains(actor) {
                return true;
            }
        }

        let percentage = self.rollout_percentage.min(FULL_ROLLOUT);
        if percentage >= FULL_ROLLOUT {
            return true;
        }
        if percentage == 0 {
            return false;
        }

        let bucket = match actor {
            Some(actor) => rollout_bucket(&self.key, actor),
            None => draw(),
        };
        bucket < percentage
    }
}
