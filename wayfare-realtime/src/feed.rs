//! Live change feed boundary.
//!
//! A [`ChangeFeed`] opens one channel per table and pushes every row-level
//! insert, update and delete into the sink it was given. Transport concerns
//! (connecting, reconnecting) stay behind this trait; the synchronizer only
//! reads the connectivity flag of each [`ChannelHandle`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wayfare_core::{ChangeAction, Row};

/// Kind of row-level change pushed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowEventKind {
    Insert,
    Update,
    Delete,
}

impl RowEventKind {
    pub fn action(&self) -> ChangeAction {
        match self {
            RowEventKind::Insert => ChangeAction::Create,
            RowEventKind::Update => ChangeAction::Update,
            RowEventKind::Delete => ChangeAction::Delete,
        }
    }
}

/// One backend change event with its row images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    pub table: String,
    pub kind: RowEventKind,
    /// Row after the change. Absent for deletes.
    #[serde(default)]
    pub new: Option<Row>,
    /// Row before the change, as far as the backend reports it.
    #[serde(default)]
    pub old: Option<Row>,
}

impl RowEvent {
    pub fn insert(table: impl Into<String>, new: Row) -> Self {
        Self {
            table: table.into(),
            kind: RowEventKind::Insert,
            new: Some(new),
            old: None,
        }
    }

    pub fn update(table: impl Into<String>, old: Row, new: Row) -> Self {
        Self {
            table: table.into(),
            kind: RowEventKind::Update,
            new: Some(new),
            old: Some(old),
        }
    }

    pub fn delete(table: impl Into<String>, old: Row) -> Self {
        Self {
            table: table.into(),
            kind: RowEventKind::Delete,
            new: None,
            old: Some(old),
        }
    }
}

/// Receives the events of one channel.
pub type EventSink = Arc<dyn Fn(RowEvent) + Send + Sync>;

/// An open live channel.
pub trait ChannelHandle: Send + Sync {
    /// Whether the transport currently reports itself connected.
    fn is_connected(&self) -> bool;

    /// Tear the channel down. Closing twice is harmless.
    fn close(&self);
}

/// Source of live row-level change events.
pub trait ChangeFeed: Send + Sync {
    /// Open a channel for `table`, delivering its events to `sink`.
    ///
    /// Never fails up front: a channel that cannot reach the backend simply
    /// reports itself disconnected.
    fn open(&self, table: &str, sink: EventSink) -> Box<dyn ChannelHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_maps_to_action() {
        assert_eq!(RowEventKind::Insert.action(), ChangeAction::Create);
        assert_eq!(RowEventKind::Update.action(), ChangeAction::Update);
        assert_eq!(RowEventKind::Delete.action(), ChangeAction::Delete);
    }

    #[test]
    fn test_kind_wire_names() {
        let kind: RowEventKind = serde_json::from_value(json!("DELETE")).unwrap();
        assert_eq!(kind, RowEventKind::Delete);
        assert_eq!(serde_json::to_value(RowEventKind::Insert).unwrap(), json!("INSERT"));
    }
}
