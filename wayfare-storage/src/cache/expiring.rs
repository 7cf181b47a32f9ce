//! Size-bounded TTL cache mirrored into durable origin storage.
//!
//! Every entry is readable only while `now < stored_at + ttl`. Expired
//! entries are removed lazily on read and in bulk by [`ExpiringCache::sweep`].
//! The store never holds more than `max_entries` entries; when it would, the
//! entries with the oldest `stored_at` go first, ties broken by insertion
//! order.
//!
//! After each mutation the whole store is written to the context's durable
//! storage under the snapshot key. Storage failures are logged and ignored:
//! the in-memory store stays authoritative for the lifetime of the context.
//! On construction the snapshot is read back and only unexpired entries are
//! kept; an unreadable snapshot means starting empty.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use wayfare_core::{system_clock, CacheSettings, ContextStorage, SharedClock};

use super::key::{generate_key, key_belongs_to};
use super::snapshot;
use super::traits::CacheStats;

/// Configuration for the expiring cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub max_entries: usize,
    /// TTL used when `set` is called without one.
    pub default_ttl: Duration,
    /// How often the background sweeper runs.
    pub sweep_interval: Duration,
    /// Durable storage key for the snapshot.
    pub snapshot_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            max_entries: settings.max_entries,
            default_ttl: settings.default_ttl(),
            sweep_interval: settings.sweep_interval(),
            snapshot_key: settings.snapshot_key.clone(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the max entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the snapshot key.
    pub fn with_snapshot_key(mut self, key: impl Into<String>) -> Self {
        self.snapshot_key = key.into();
        self
    }
}

/// One cached value.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub data: T,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
    seq: u64,
}

impl<T> CacheEntry<T> {
    /// The instant after which the entry is no longer readable.
    ///
    /// `None` when the TTL is too large to represent, i.e. never.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires_at| now >= expires_at)
    }
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

impl SweepReport {
    pub fn changed(&self) -> bool {
        self.expired > 0 || self.evicted > 0
    }
}

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    next_seq: u64,
    stats: CacheStats,
}

impl<T> CacheInner<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            stats: CacheStats::default(),
        }
    }

    fn insert(&mut self, key: String, data: T, stored_at: DateTime<Utc>, ttl: Duration) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key,
            CacheEntry {
                data,
                stored_at,
                ttl,
                seq,
            },
        );
    }

    fn remove_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        self.stats.expirations += removed as u64;
        removed
    }

    /// Drop the oldest entries until at most `max` remain.
    fn evict_overflow(&mut self, max: usize) -> usize {
        let overflow = self.entries.len().saturating_sub(max);
        if overflow == 0 {
            return 0;
        }
        let mut order: Vec<(DateTime<Utc>, u64, String)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.stored_at, entry.seq, key.clone()))
            .collect();
        order.sort();
        for (_, _, key) in order.into_iter().take(overflow) {
            self.entries.remove(&key);
        }
        self.stats.evictions += overflow as u64;
        overflow
    }
}

/// Generic, size-bounded TTL cache for query results.
pub struct ExpiringCache<T> {
    inner: Mutex<CacheInner<T>>,
    storage: Option<ContextStorage>,
    clock: SharedClock,
    config: CacheConfig,
}

impl<T> ExpiringCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a cache persisted to `storage`, hydrating from its snapshot.
    pub fn new(config: CacheConfig, storage: ContextStorage) -> Self {
        Self::with_clock(config, storage, system_clock())
    }

    /// Like [`new`](Self::new) with an explicit time source.
    pub fn with_clock(config: CacheConfig, storage: ContextStorage, clock: SharedClock) -> Self {
        let cache = Self {
            inner: Mutex::new(CacheInner::new()),
            storage: Some(storage),
            clock,
            config,
        };
        cache.hydrate();
        cache
    }

    /// Create a cache that is never persisted.
    pub fn ephemeral(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(CacheInner::new()),
            storage: None,
            clock,
            config,
        }
    }

    /// Build the key for one query. See [`generate_key`].
    pub fn generate_key<P: Serialize + ?Sized>(table: &str, operation: &str, params: &P) -> String {
        generate_key(table, operation, params)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current time according to the cache's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Return the value under `key` if it is still live.
    ///
    /// An expired entry found here is deleted.
    pub fn get(&self, key: &str) -> Option<T> {
        self.get_with_timestamp(key).map(|(data, _)| data)
    }

    /// Like [`get`](Self::get), also returning when the value was stored.
    pub fn get_with_timestamp(&self, key: &str) -> Option<(T, DateTime<Utc>)> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let expired = inner.entries.get(key).map(|entry| entry.is_expired(now));
        match expired {
            Some(false) => {
                inner.stats.hits += 1;
                debug!(key = %key, "Cache hit");
                inner
                    .entries
                    .get(key)
                    .map(|entry| (entry.data.clone(), entry.stored_at))
            }
            Some(true) => {
                inner.entries.remove(key);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                debug!(key = %key, "Cache entry expired");
                self.persist(&inner);
                None
            }
            None => {
                inner.stats.misses += 1;
                debug!(key = %key, "Cache miss");
                None
            }
        }
    }

    /// Same expiry semantics as [`get`](Self::get) without cloning the value.
    pub fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.entries.get(key).map(|entry| entry.is_expired(now)) {
            Some(false) => true,
            Some(true) => {
                inner.entries.remove(key);
                inner.stats.expirations += 1;
                self.persist(&inner);
                false
            }
            None => false,
        }
    }

    /// Store `value` under `key`, resetting its timestamp.
    ///
    /// `ttl` falls back to the configured default.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Option<Duration>) {
        let key = key.into();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.entries.remove(&key);
        inner.insert(key, value, now, ttl);
        let evicted = inner.evict_overflow(self.config.max_entries);
        if evicted > 0 {
            debug!(evicted, "Evicted oldest cache entries");
        }
        self.persist(&inner);
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.lock();
        let existed = inner.entries.remove(key).is_some();
        self.persist(&inner);
        existed
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        self.persist(&inner);
    }

    /// Remove every entry cached for `table`. Returns how many were removed.
    pub fn invalidate_table(&self, table: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key_belongs_to(key, table));
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(table = %table, removed, "Invalidated cached table");
            self.persist(&inner);
        }
        removed
    }

    /// Drop expired entries, then evict the oldest while over capacity.
    ///
    /// Re-persists only if something was removed.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut inner = self.lock();
        let report = SweepReport {
            expired: inner.remove_expired(now),
            evicted: inner.evict_overflow(self.config.max_entries),
        };
        if report.changed() {
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                "Cache sweep removed entries"
            );
            self.persist(&inner);
        }
        report
    }

    /// Number of physically present entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of physically present entries, oldest insertion first.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.lock();
        let mut keys: Vec<(u64, &String)> =
            inner.entries.iter().map(|(k, e)| (e.seq, k)).collect();
        keys.sort();
        keys.into_iter().map(|(_, k)| k.clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entry_count: inner.entries.len() as u64,
            ..inner.stats.clone()
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<T>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock still guards valid data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hydrate(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let key = &self.config.snapshot_key;
        let text = match storage.get_item(key) {
            Ok(Some(text)) => text,
            Ok(None) => return,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache snapshot unreadable, starting empty");
                return;
            }
        };
        let entries = match snapshot::decode::<T>(key, &text) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache snapshot malformed, starting empty");
                return;
            }
        };

        let now = self.clock.now();
        let mut inner = self.lock();
        let mut dropped = 0usize;
        for entry in entries {
            let restored = CacheEntry {
                data: entry.data,
                stored_at: entry.stored_at,
                ttl: entry.ttl,
                seq: 0,
            };
            if restored.is_expired(now) {
                dropped += 1;
                continue;
            }
            inner.insert(entry.key, restored.data, restored.stored_at, restored.ttl);
        }
        inner.evict_overflow(self.config.max_entries);
        debug!(
            restored = inner.entries.len(),
            dropped, "Hydrated cache from snapshot"
        );
    }

    fn persist(&self, inner: &CacheInner<T>) {
        let Some(storage) = &self.storage else {
            return;
        };
        let mut ordered: Vec<(&String, &CacheEntry<T>)> = inner.entries.iter().collect();
        ordered.sort_by_key(|(_, entry)| entry.seq);
        let encoded = snapshot::encode(
            ordered
                .into_iter()
                .map(|(key, entry)| (key.as_str(), &entry.data, entry.stored_at, entry.ttl)),
        );
        let key = &self.config.snapshot_key;
        let result = match encoded {
            Ok(text) => storage.set_item(key, &text).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(reason) = result {
            warn!(key = %key, error = %reason, "Failed to persist cache snapshot");
        }
    }
}
