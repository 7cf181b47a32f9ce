//! Wayfare Test Utilities
//!
//! Centralized test infrastructure for the Wayfare workspace:
//! - Controllable clock and failing storage backends
//! - In-memory remote store and scripted change feed
//! - Proptest generators for rows and change events
//! - Row and configuration fixtures
//! - Custom assertions for cache reads and change records

pub use wayfare_core::{
    ChangeAction, ChangeRecord, Clock, ContextStorage, DurableStore, FetchError, LayerConfig,
    MemoryStore, Origin, Row, SharedClock, StorageError, StorageResult,
};
pub use wayfare_realtime::{ChangeFeed, ChannelHandle, EventSink, RowEvent, RowEventKind};
pub use wayfare_storage::{CacheRead, RemoteStore};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// CLOCK AND STORAGE DOUBLES
// ============================================================================

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at a fixed instant, in milliseconds since the epoch.
    pub fn at_millis(millis: i64) -> Self {
        Self::new(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }

    /// This clock as a [`SharedClock`] sharing the same time.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at_millis(1_700_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Durable store whose every call fails, like disabled browser storage.
#[derive(Debug, Default)]
pub struct FailingStore;

impl FailingStore {
    fn unavailable<T>() -> StorageResult<T> {
        Err(StorageError::Unavailable {
            reason: "storage disabled".to_string(),
        })
    }
}

impl DurableStore for FailingStore {
    fn get_item(&self, _key: &str) -> StorageResult<Option<String>> {
        Self::unavailable()
    }

    fn set_item(&self, _key: &str, _value: &str) -> StorageResult<()> {
        Self::unavailable()
    }

    fn remove_item(&self, _key: &str) -> StorageResult<()> {
        Self::unavailable()
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Self::unavailable()
    }
}

/// Origin whose storage always fails.
pub fn failing_origin() -> Arc<Origin> {
    Origin::new(Arc::new(FailingStore))
}

// ============================================================================
// REMOTE STORE DOUBLE
// ============================================================================

/// Remote store serving rows from memory, with read counting and failure
/// injection.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    failure: Mutex<Option<FetchError>>,
    reads: AtomicU64,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows of `table`.
    pub fn with_rows(self, table: &str, rows: Vec<Row>) -> Self {
        self.tables.lock().unwrap().insert(table.to_string(), rows);
        self
    }

    /// Insert `row`, replacing any row with the same `id`.
    pub fn upsert(&self, table: &str, row: Row) {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        match rows.iter_mut().find(|r| r.get("id") == row.get("id")) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    /// Make every following read fail with `error`, or succeed again on `None`.
    pub fn set_failure(&self, error: Option<FetchError>) {
        *self.failure.lock().unwrap() = error;
    }

    /// Number of reads served or failed so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn begin_read(&self) -> Result<(), FetchError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn fetch_all(&self, table: &str) -> Result<Vec<Row>, FetchError> {
        self.begin_read()?;
        Ok(self.rows(table))
    }

    async fn fetch_by_id(&self, table: &str, id: &Value) -> Result<Option<Row>, FetchError> {
        self.begin_read()?;
        Ok(self.rows(table).into_iter().find(|r| r.get("id") == Some(id)))
    }

    async fn fetch_top_n(
        &self,
        table: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<Row>, FetchError> {
        self.begin_read()?;
        let mut rows = self.rows(table);
        rows.sort_by(|a, b| {
            let a = a.get(field).and_then(Value::as_f64).unwrap_or(f64::MIN);
            let b = b.get(field).and_then(Value::as_f64).unwrap_or(f64::MIN);
            b.total_cmp(&a)
        });
        rows.truncate(limit);
        Ok(rows)
    }
}

// ============================================================================
// CHANGE FEED DOUBLE
// ============================================================================

/// Connectivity and teardown state of one scripted channel.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    connected: AtomicBool,
    closed: AtomicBool,
}

impl ScriptedChannel {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedHandle(Arc<ScriptedChannel>);

impl ChannelHandle for ScriptedHandle {
    fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst) && !self.0.is_closed()
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

struct OpenedChannel {
    table: String,
    sink: EventSink,
    channel: Arc<ScriptedChannel>,
}

/// Change feed driven by the test: events are pushed with [`emit`].
///
/// [`emit`]: ScriptedChangeFeed::emit
#[derive(Default)]
pub struct ScriptedChangeFeed {
    opened: Mutex<Vec<OpenedChannel>>,
    connect_on_open: AtomicBool,
}

impl ScriptedChangeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A feed whose channels report connected as soon as they open.
    pub fn connected() -> Arc<Self> {
        let feed = Self::default();
        feed.connect_on_open.store(true, Ordering::SeqCst);
        Arc::new(feed)
    }

    /// Channels ever opened, including closed ones.
    pub fn opened_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// Channels for `table` that are still open.
    pub fn open_count(&self, table: &str) -> usize {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.table == table && !c.channel.is_closed())
            .count()
    }

    /// The most recently opened channel for `table`.
    pub fn channel(&self, table: &str) -> Option<Arc<ScriptedChannel>> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.table == table)
            .map(|c| Arc::clone(&c.channel))
    }

    /// Flip connectivity of every open channel for `table`.
    pub fn set_connected(&self, table: &str, connected: bool) {
        for c in self.opened.lock().unwrap().iter() {
            if c.table == table {
                c.channel.connected.store(connected, Ordering::SeqCst);
            }
        }
    }

    /// Deliver `event` to every open channel of its table.
    pub fn emit(&self, event: RowEvent) {
        let sinks: Vec<EventSink> = self
            .opened
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.table == event.table && !c.channel.is_closed())
            .map(|c| Arc::clone(&c.sink))
            .collect();
        for sink in sinks {
            sink(event.clone());
        }
    }
}

impl ChangeFeed for ScriptedChangeFeed {
    fn open(&self, table: &str, sink: EventSink) -> Box<dyn ChannelHandle> {
        let channel = Arc::new(ScriptedChannel::default());
        channel
            .connected
            .store(self.connect_on_open.load(Ordering::SeqCst), Ordering::SeqCst);
        self.opened.lock().unwrap().push(OpenedChannel {
            table: table.to_string(),
            sink,
            channel: Arc::clone(&channel),
        });
        Box::new(ScriptedHandle(channel))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for rows and change events.

    use super::*;
    use proptest::prelude::*;

    /// Generate a table name, including ones that prefix each other.
    pub fn arb_table_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("destinations".to_string()),
            Just("reviews".to_string()),
            Just("tour".to_string()),
            Just("tour_stops".to_string()),
            "[a-z]{1,10}",
        ]
    }

    /// Generate a ChangeAction.
    pub fn arb_change_action() -> impl Strategy<Value = ChangeAction> {
        prop_oneof![
            Just(ChangeAction::Create),
            Just(ChangeAction::Update),
            Just(ChangeAction::Delete),
        ]
    }

    /// Generate a destination-shaped row.
    pub fn arb_destination_row() -> impl Strategy<Value = Row> {
        (
            1i64..10_000,
            "[A-Z][a-z]{2,12}",
            0u32..=50,
            0u32..100,
            any::<bool>(),
        )
            .prop_map(|(id, name, rating_tenths, order_position, is_active)| {
                let mut row = fixtures::destination_row(
                    id,
                    &name,
                    f64::from(rating_tenths) / 10.0,
                    i64::from(order_position),
                );
                row.insert("is_active".to_string(), Value::Bool(is_active));
                row
            })
    }

    /// Generate an update event between two destination images sharing an id.
    pub fn arb_update_event() -> impl Strategy<Value = RowEvent> {
        (arb_destination_row(), arb_destination_row()).prop_map(|(old, mut new)| {
            if let Some(id) = old.get("id") {
                new.insert("id".to_string(), id.clone());
            }
            RowEvent::update("destinations", old, new)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built rows and configuration.

    use super::*;
    use serde_json::json;

    /// Turn a JSON object literal into a row. Panics on non-objects.
    pub fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("row fixture must be an object, got {other}"),
        }
    }

    pub fn destination_row(id: i64, name: &str, rating: f64, order_position: i64) -> Row {
        row(json!({
            "id": id,
            "name": name,
            "description": format!("{name} description"),
            "rating": rating,
            "order_position": order_position,
            "is_active": true,
        }))
    }

    pub fn review_row(id: i64, destination_id: i64, rating: f64) -> Row {
        row(json!({
            "id": id,
            "destination_id": destination_id,
            "rating": rating,
            "comment": "Lovely",
        }))
    }

    /// A small sample of destinations with distinct ratings.
    pub fn sample_destinations() -> Vec<Row> {
        vec![
            destination_row(1, "Old Town", 4.2, 1),
            destination_row(2, "Harbour", 4.8, 2),
            destination_row(3, "Castle Hill", 3.9, 3),
            destination_row(4, "Botanic Garden", 4.5, 4),
        ]
    }

    /// Remote store pre-filled with [`sample_destinations`].
    pub fn sample_remote() -> InMemoryRemoteStore {
        InMemoryRemoteStore::new().with_rows("destinations", sample_destinations())
    }

    /// Layer configuration with small limits for tests.
    pub fn test_config() -> LayerConfig {
        let mut config = LayerConfig::default();
        config.cache.max_entries = 8;
        config.cache.snapshot_key = "test.query-cache".to_string();
        config.broadcast.signal_key = "test.sync-trigger".to_string();
        config.realtime.status_poll_interval_ms = 100;
        config
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for Wayfare-specific validation.

    use super::*;

    /// Assert that a read was served from the cache.
    #[track_caller]
    pub fn assert_cache_hit<T: std::fmt::Debug>(read: &CacheRead<T>) {
        assert!(read.was_cache_hit(), "Expected cache hit, got remote read: {:?}", read);
    }

    /// Assert that a read went to the remote store.
    #[track_caller]
    pub fn assert_cache_miss<T: std::fmt::Debug>(read: &CacheRead<T>) {
        assert!(read.was_cache_miss(), "Expected remote read, got cache hit: {:?}", read);
    }

    /// Assert the exact `changed_fields` of a change record.
    #[track_caller]
    pub fn assert_changed_fields(record: &ChangeRecord, expected: &[&str]) {
        let actual: Vec<&str> = record.changed_fields.iter().map(String::as_str).collect();
        assert_eq!(actual, expected, "Unexpected changed fields for {}", record.table);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let shared = clock.shared();
        clock.advance(Duration::from_secs(5));
        assert_eq!(shared.now(), clock.now());
        assert_eq!(
            clock.now().timestamp_millis(),
            1_700_000_000_000 + 5_000
        );
    }

    #[test]
    fn test_failing_store_fails() {
        let origin = failing_origin();
        let ctx = origin.attach();
        assert!(ctx.set_item("k", "v").is_err());
        assert!(ctx.get_item("k").is_err());
    }

    #[tokio::test]
    async fn test_remote_store_top_n_and_failure() {
        let remote = fixtures::sample_remote();
        let top = remote.fetch_top_n("destinations", "rating", 2).await.unwrap();
        assert_eq!(top[0]["name"], json!("Harbour"));
        assert_eq!(top[1]["name"], json!("Botanic Garden"));

        remote.set_failure(Some(FetchError::Transport {
            reason: "offline".into(),
        }));
        assert!(remote.fetch_all("destinations").await.is_err());
        assert_eq!(remote.reads(), 2);
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let remote = fixtures::sample_remote();
        remote.upsert("destinations", fixtures::destination_row(2, "Harbour", 5.0, 2));
        let rows = remote.rows("destinations");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1]["rating"], json!(5.0));
    }

    #[test]
    fn test_scripted_feed_delivers_to_open_channels_only() {
        let feed = ScriptedChangeFeed::new();
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        let sink: EventSink = Arc::new(move |_event: RowEvent| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let handle = feed.open("reviews", sink);

        feed.emit(RowEvent::insert("reviews", fixtures::review_row(1, 2, 4.0)));
        feed.emit(RowEvent::insert("destinations", fixtures::destination_row(1, "x", 1.0, 1)));
        handle.close();
        feed.emit(RowEvent::insert("reviews", fixtures::review_row(2, 2, 4.0)));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(feed.open_count("reviews"), 0);
        assert!(feed.channel("reviews").unwrap().is_closed());
    }

    #[test]
    fn test_test_config_is_valid() {
        fixtures::test_config().validate().unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_update_events_keep_id(event in generators::arb_update_event()) {
            prop_assert_eq!(event.kind, RowEventKind::Update);
            let old_id = event.old.as_ref().and_then(|r| r.get("id")).cloned();
            let new_id = event.new.as_ref().and_then(|r| r.get("id")).cloned();
            prop_assert_eq!(old_id, new_id);
        }
    }
}
