//! Snapshot encoding for the expiring cache.
//!
//! The whole store is written as one JSON document under a single durable
//! storage key. Entries are listed in insertion order so the eviction
//! tie-break survives a reload.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use wayfare_core::SnapshotError;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a, T> {
    version: u32,
    entries: Vec<EntryRef<'a, T>>,
}

#[derive(Serialize)]
struct EntryRef<'a, T> {
    key: &'a str,
    data: &'a T,
    stored_at: i64,
    ttl_ms: u64,
}

#[derive(Deserialize)]
struct SnapshotOwned<T> {
    version: u32,
    entries: Vec<EntryOwned<T>>,
}

#[derive(Deserialize)]
struct EntryOwned<T> {
    key: String,
    data: T,
    stored_at: i64,
    ttl_ms: u64,
}

/// One decoded snapshot entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry<T> {
    pub key: String,
    pub data: T,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// Encode entries, given in insertion order.
pub fn encode<'a, T, I>(entries: I) -> Result<String, SnapshotError>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = (&'a str, &'a T, DateTime<Utc>, Duration)>,
{
    let snapshot = SnapshotRef {
        version: SNAPSHOT_VERSION,
        entries: entries
            .into_iter()
            .map(|(key, data, stored_at, ttl)| EntryRef {
                key,
                data,
                stored_at: stored_at.timestamp_millis(),
                ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            })
            .collect(),
    };
    serde_json::to_string(&snapshot).map_err(|e| SnapshotError::Encode {
        reason: e.to_string(),
    })
}

/// Decode a snapshot previously written by [`encode`].
///
/// `storage_key` only labels the error.
pub fn decode<T: DeserializeOwned>(
    storage_key: &str,
    text: &str,
) -> Result<Vec<SnapshotEntry<T>>, SnapshotError> {
    let malformed = |reason: String| SnapshotError::Malformed {
        key: storage_key.to_string(),
        reason,
    };

    let snapshot: SnapshotOwned<T> =
        serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(malformed(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }

    snapshot
        .entries
        .into_iter()
        .map(|entry| {
            let stored_at = DateTime::from_timestamp_millis(entry.stored_at)
                .ok_or_else(|| malformed(format!("invalid timestamp {}", entry.stored_at)))?;
            Ok(SnapshotEntry {
                key: entry.key,
                data: entry.data,
                stored_at,
                ttl: Duration::from_millis(entry.ttl_ms),
            })
        })
        .collect()
}
