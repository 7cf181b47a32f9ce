//! Wayfare Core - shared types for the data consistency layer
//!
//! The consistency layer keeps every open view of the tourism app close to
//! the remote data store. It is made of three independent components that
//! live in their own crates:
//!
//! - `wayfare-storage`: expiring read cache snapshotted to origin storage
//! - `wayfare-events`: cross-context invalidation broadcaster
//! - `wayfare-realtime`: change-stream synchronizer
//!
//! This crate holds what they share: row and signal types, the error
//! taxonomy, configuration, the clock abstraction and the durable per-origin
//! storage boundary.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod storage;
pub mod types;

pub use clock::{system_clock, Clock, SharedClock, SystemClock};
pub use config::{
    BroadcastSettings, CacheSettings, LayerConfig, LiveSettings, LmdbSettings, RealtimeSettings,
    ReconnectConfig, RemoteSettings, TtlPolicy, DEFAULT_TRACKED_FIELDS,
};
pub use error::{
    ChannelError, ConfigError, FetchError, SnapshotError, StorageError, StorageResult,
    WayfareError, WayfareResult,
};
pub use logging::{call_isolated, init_tracing, LogFormat};
pub use storage::{
    ContextStorage, DurableStore, MemoryStore, Origin, StorageEvent, StorageNotice,
    StorageWatcher,
};
pub use types::{
    ChangeAction, ChangeRecord, ContextId, InvalidationSignal, Row, CHANGED_ALL, CHANGED_DELETED,
};
