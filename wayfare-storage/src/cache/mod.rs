//! Expiring read cache.
//!
//! Query results are cached in memory with a per-entry TTL, bounded in size,
//! and mirrored into the context's durable storage so a reload starts warm.
//! Reads through [`CachedQueries`] return a [`CacheRead<T>`] that tells the
//! caller whether the value came from the cache and when it was stored.
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(ExpiringCache::new(CacheConfig::from(&config.cache), storage));
//! let _sweeper = spawn_sweeper(&cache, cache.config().sweep_interval);
//! let queries = CachedQueries::new(cache, RestRemoteStore::new(&config.remote)?, config.ttl_policy);
//!
//! let read = queries.get_top_n("destinations", "rating", 5).await?;
//! if read.was_cache_hit() {
//!     tracing::debug!(age = ?read.staleness(Utc::now()), "Served cached ranking");
//! }
//! ```

pub mod expiring;
pub mod freshness;
pub mod key;
pub mod read_through;
pub mod snapshot;
pub mod sweeper;
pub mod traits;

pub use expiring::{CacheConfig, CacheEntry, ExpiringCache, SweepReport};
pub use freshness::CacheRead;
pub use key::{generate_key, key_belongs_to};
pub use read_through::{CachedQueries, Cacheable, OperationMetrics, QueryMetrics, QueryOperation};
pub use snapshot::SnapshotEntry;
pub use sweeper::{spawn_sweeper, SweeperHandle};
pub use traits::CacheStats;
