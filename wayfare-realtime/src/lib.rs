//! Wayfare Realtime - change-stream synchronizer
//!
//! Subscribes views to row-level changes pushed by the backend. One live
//! channel is kept per table while it has listeners; each incoming event is
//! classified into a [`ChangeRecord`](wayfare_core::ChangeRecord) listing the
//! tracked fields that changed, then handed to the table's listeners.
//!
//! - [`feed`]: the live channel boundary ([`ChangeFeed`], [`RowEvent`])
//! - [`diff`]: change classification against the tracked field list
//! - [`synchronizer`]: per-table channel and listener registry
//! - [`hooks`]: view-level subscriptions with connectivity polling
//! - [`ws`]: WebSocket implementation of [`ChangeFeed`]

pub mod diff;
pub mod feed;
pub mod hooks;
pub mod synchronizer;
pub mod ws;

pub use diff::{classify, TrackedFields};
pub use feed::{ChangeFeed, ChannelHandle, EventSink, RowEvent, RowEventKind};
pub use hooks::{subscribe_to_ordering_changes, subscribe_to_ranking_changes, LiveUpdates};
pub use synchronizer::{
    ChangeListener, ChangeSynchronizer, ChannelState, MultiSubscription, Subscription,
};
pub use ws::{decode_frame, subscribe_frame, WsChangeFeed};
