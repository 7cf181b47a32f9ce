//! Change classification.
//!
//! Updates are diffed against a declared list of tracked fields only. A
//! field that changes outside the list does not show up in
//! `changed_fields`.

use serde_json::Value;
use wayfare_core::{
    ChangeAction, ChangeRecord, RealtimeSettings, Row, CHANGED_ALL, CHANGED_DELETED,
    DEFAULT_TRACKED_FIELDS,
};

use crate::feed::RowEvent;

/// Field names compared between the old and new image of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFields {
    fields: Vec<String>,
}

impl TrackedFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Tracked fields whose value differs between `old` and `new`.
    ///
    /// A field present on one side and absent on the other counts as changed.
    /// Result order follows the tracked list.
    pub fn changed_fields(&self, old: Option<&Row>, new: &Row) -> Vec<String> {
        self.fields
            .iter()
            .filter(|field| {
                let before = old.and_then(|row| row.get(field.as_str()));
                !values_equal(before, new.get(field.as_str()))
            })
            .cloned()
            .collect()
    }
}

impl Default for TrackedFields {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKED_FIELDS.iter().copied())
    }
}

impl From<&RealtimeSettings> for TrackedFields {
    fn from(settings: &RealtimeSettings) -> Self {
        Self::new(settings.tracked_fields.iter().cloned())
    }
}

/// Strict value equality. Numbers compare by value, so `4` equals `4.0`.
fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Build the change record for one backend event.
pub fn classify(event: &RowEvent, tracked: &TrackedFields) -> ChangeRecord {
    let action = event.kind.action();
    let (record, changed_fields) = match action {
        ChangeAction::Create => (
            event.new.clone().unwrap_or_default(),
            vec![CHANGED_ALL.to_string()],
        ),
        ChangeAction::Update => {
            let new = event.new.clone().unwrap_or_default();
            let changed = tracked.changed_fields(event.old.as_ref(), &new);
            (new, changed)
        }
        ChangeAction::Delete => (
            event.old.clone().unwrap_or_default(),
            vec![CHANGED_DELETED.to_string()],
        ),
    };

    ChangeRecord {
        table: event.table.clone(),
        id: record.get("id").cloned().unwrap_or(Value::Null),
        action,
        record,
        changed_fields,
    }
}
