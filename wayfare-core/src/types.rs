//! Shared record and signal types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// One row image from a remote collection.
pub type Row = Map<String, Value>;

/// Sentinel `changed_fields` entry for a created record.
pub const CHANGED_ALL: &str = "all";

/// Sentinel `changed_fields` entry for a deleted record.
pub const CHANGED_DELETED: &str = "deleted";

/// Kind of mutation a signal or change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one execution context (tab/window) attached to an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The shared "something changed" marker written under the well-known key.
///
/// Only the latest signal is observable. The random `nonce` guarantees that
/// two consecutive signals for the same table and action still differ, so
/// every write is seen as a change by other contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationSignal {
    pub table: String,
    pub action: ChangeAction,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub nonce: u64,
}

/// Structured description of one backend change event.
///
/// Built per event, handed to listeners, then dropped. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    /// Value of the row's `id` column, `Null` when the row carries none.
    pub id: Value,
    pub action: ChangeAction,
    /// New row image for create/update, previous image for delete.
    pub record: Row,
    pub changed_fields: Vec<String>,
}

impl ChangeRecord {
    /// True when `field` is explicitly listed in `changed_fields`.
    ///
    /// The `all`/`deleted` sentinels do not match concrete field names.
    pub fn touches(&self, field: &str) -> bool {
        self.changed_fields.iter().any(|f| f == field)
    }

    pub fn is_create(&self) -> bool {
        self.action == ChangeAction::Create
    }

    pub fn is_delete(&self) -> bool {
        self.action == ChangeAction::Delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_action_serializes_lowercase() {
        let json = serde_json::to_string(&ChangeAction::Update).unwrap();
        assert_eq!(json, "\"update\"");
        let back: ChangeAction = serde_json::from_str("\"delete\"").unwrap();
        assert_eq!(back, ChangeAction::Delete);
    }

    #[test]
    fn test_signal_round_trips_through_json() {
        let signal = InvalidationSignal {
            table: "destinations".to_string(),
            action: ChangeAction::Create,
            timestamp: 1_700_000_000_000,
            nonce: 42,
        };
        let text = serde_json::to_string(&signal).unwrap();
        assert!(text.contains("\"action\":\"create\""));
        let back: InvalidationSignal = serde_json::from_str(&text).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn test_touches_ignores_sentinels() {
        let record = ChangeRecord {
            table: "destinations".to_string(),
            id: json!(7),
            action: ChangeAction::Create,
            record: Row::new(),
            changed_fields: vec![CHANGED_ALL.to_string()],
        };
        assert!(!record.touches("rating"));
        assert!(record.touches(CHANGED_ALL));
        assert!(record.is_create());
    }

    #[test]
    fn test_context_ids_are_unique() {
        assert_ne!(ContextId::new(), ContextId::new());
    }
}
