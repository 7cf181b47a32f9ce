//! Wayfare Storage - expiring read cache and remote store access
//!
//! Holds the size-bounded TTL cache that survives reloads through durable
//! origin storage, the read-through query helpers built on it, the remote
//! data store client, and an LMDB durable backend.

pub mod cache;
pub mod lmdb;
pub mod remote;

pub use cache::{
    generate_key, key_belongs_to, spawn_sweeper, CacheConfig, CacheEntry, CacheRead,
    CacheStats, Cacheable, CachedQueries, ExpiringCache, OperationMetrics, QueryMetrics,
    QueryOperation, SnapshotEntry, SweepReport, SweeperHandle,
};
pub use lmdb::LmdbStore;
pub use remote::{RemoteStore, RestRemoteStore};
