//! Read results carrying cache provenance.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of a read-through query, carrying staleness metadata.
///
/// Callers can tell whether the value came from the cache (and how old it
/// is) or straight from the remote data store.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    /// The value.
    value: T,
    /// When this value was cached (or fetched from the remote store).
    cached_at: DateTime<Utc>,
    /// Whether this was a cache hit or miss.
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    /// Create a new cache read from a cache hit.
    pub fn from_cache(value: T, cached_at: DateTime<Utc>) -> Self {
        Self {
            value,
            cached_at,
            was_cache_hit: true,
        }
    }

    /// Create a new cache read from a remote fetch (cache miss).
    pub fn from_remote(value: T, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value,
            cached_at: fetched_at,
            was_cache_hit: false,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Get a reference to the underlying value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// How old the data is relative to `now`.
    pub fn staleness(&self, now: DateTime<Utc>) -> Duration {
        (now - self.cached_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Get when this value was cached.
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    /// The `fromCache` flag: true when no remote read was performed.
    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    /// Check if this was a cache miss (fetched from the remote store).
    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            cached_at: self.cached_at,
            was_cache_hit: self.was_cache_hit,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_read_from_cache() {
        let value = "test_value".to_string();
        let cached_at = Utc::now();
        let read = CacheRead::from_cache(value.clone(), cached_at);

        assert!(read.was_cache_hit());
        assert!(!read.was_cache_miss());
        assert_eq!(read.value(), &value);
        assert_eq!(read.cached_at(), cached_at);
    }

    #[test]
    fn test_cache_read_from_remote() {
        let read = CacheRead::from_remote(42i32, Utc::now());

        assert!(!read.was_cache_hit());
        assert!(read.was_cache_miss());
        assert_eq!(read.into_value(), 42);
    }

    #[test]
    fn test_cache_read_staleness() {
        let cached_at = Utc::now();
        let read = CacheRead::from_cache("test", cached_at);

        let later = cached_at + chrono::Duration::seconds(5);
        assert_eq!(read.staleness(later), Duration::from_secs(5));
        let earlier = cached_at - chrono::Duration::seconds(5);
        assert_eq!(read.staleness(earlier), Duration::ZERO);
    }

    #[test]
    fn test_cache_read_map() {
        let read = CacheRead::from_remote(42i32, Utc::now());
        let mapped = read.map(|v| v.to_string());

        assert_eq!(mapped.into_value(), "42");
    }
}
