//! Change-stream synchronizer.
//!
//! Keeps one live channel per table for as long as that table has at least
//! one listener. Every incoming row event is classified once and handed to
//! the table's listeners in registration order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};
use wayfare_core::{call_isolated, ChangeRecord, RealtimeSettings};

use crate::diff::{classify, TrackedFields};
use crate::feed::{ChangeFeed, ChannelHandle, EventSink, RowEvent};

/// Callback receiving one classified change.
pub type ChangeListener = Arc<dyn Fn(&ChangeRecord) + Send + Sync>;

/// Lifecycle of one table's live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unsubscribed,
    /// Channel open, transport not connected yet (or reconnecting).
    Subscribing,
    Subscribed,
}

struct TableChannel {
    handle: Box<dyn ChannelHandle>,
    listeners: Vec<(u64, ChangeListener)>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    channels: HashMap<String, TableChannel>,
}

struct Inner {
    feed: Arc<dyn ChangeFeed>,
    tracked: TrackedFields,
    ranking_field: String,
    ordering_field: String,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, table: &str, event: RowEvent) {
        let listeners: Vec<ChangeListener> = match self.registry().channels.get(table) {
            Some(channel) => channel
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect(),
            None => return,
        };

        let mut record = classify(&event, &self.tracked);
        record.table = table.to_string();
        debug!(
            table = %table,
            action = %record.action,
            changed = ?record.changed_fields,
            listeners = listeners.len(),
            "Dispatching change"
        );
        for listener in listeners {
            call_isolated("change-synchronizer", || (*listener)(&record));
        }
    }

    fn remove(&self, table: &str, id: u64) {
        let closed = {
            let mut registry = self.registry();
            let Some(channel) = registry.channels.get_mut(table) else {
                return;
            };
            channel.listeners.retain(|(entry_id, _)| *entry_id != id);
            if channel.listeners.is_empty() {
                registry.channels.remove(table)
            } else {
                None
            }
        };
        if let Some(channel) = closed {
            channel.handle.close();
            info!(table = %table, "Closed live channel");
        }
    }
}

/// Fans live change events out to per-table listeners.
#[derive(Clone)]
pub struct ChangeSynchronizer {
    inner: Arc<Inner>,
}

impl ChangeSynchronizer {
    pub fn new(feed: Arc<dyn ChangeFeed>, settings: &RealtimeSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                feed,
                tracked: TrackedFields::from(settings),
                ranking_field: settings.ranking_field.clone(),
                ordering_field: settings.ordering_field.clone(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn tracked_fields(&self) -> &TrackedFields {
        &self.inner.tracked
    }

    pub fn ranking_field(&self) -> &str {
        &self.inner.ranking_field
    }

    pub fn ordering_field(&self) -> &str {
        &self.inner.ordering_field
    }

    /// Call `callback` for every change to `table`.
    ///
    /// The first listener of a table opens its live channel; the channel
    /// closes when the last listener unsubscribes.
    pub fn subscribe_to_data_changes<F>(&self, table: &str, callback: F) -> Subscription
    where
        F: Fn(&ChangeRecord) + Send + Sync + 'static,
    {
        self.add_listener(table, Arc::new(callback))
    }

    /// Subscribe the same callback to each of `tables`.
    pub fn subscribe_to_multiple_tables<I, S, F>(&self, tables: I, callback: F) -> MultiSubscription
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&ChangeRecord) + Send + Sync + 'static,
    {
        let callback: ChangeListener = Arc::new(callback);
        let subscriptions = tables
            .into_iter()
            .map(|table| self.add_listener(table.as_ref(), Arc::clone(&callback)))
            .collect();
        MultiSubscription { subscriptions }
    }

    fn add_listener(&self, table: &str, listener: ChangeListener) -> Subscription {
        {
            let mut registry = self.inner.registry();
            let id = registry.next_id;
            if let Some(channel) = registry.channels.get_mut(table) {
                channel.listeners.push((id, listener));
                registry.next_id += 1;
                return self.subscription(table, id);
            }
        }

        // Open outside the lock: a feed may deliver events from `open`.
        let handle = self.inner.feed.open(table, self.sink_for(table));

        let mut registry = self.inner.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        match registry.channels.get_mut(table) {
            Some(channel) => {
                channel.listeners.push((id, listener));
                drop(registry);
                handle.close();
            }
            None => {
                registry.channels.insert(
                    table.to_string(),
                    TableChannel {
                        handle,
                        listeners: vec![(id, listener)],
                    },
                );
                info!(table = %table, "Opened live channel");
            }
        }
        self.subscription(table, id)
    }

    fn sink_for(&self, table: &str) -> EventSink {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let table = table.to_string();
        Arc::new(move |event: RowEvent| {
            if let Some(inner) = inner.upgrade() {
                inner.dispatch(&table, event);
            }
        })
    }

    fn subscription(&self, table: &str, id: u64) -> Subscription {
        Subscription {
            inner: Arc::downgrade(&self.inner),
            table: table.to_string(),
            id,
        }
    }

    /// Connectivity of every table with an open channel.
    pub fn get_subscription_status(&self) -> BTreeMap<String, bool> {
        self.inner
            .registry()
            .channels
            .iter()
            .map(|(table, channel)| (table.clone(), channel.handle.is_connected()))
            .collect()
    }

    pub fn channel_state(&self, table: &str) -> ChannelState {
        match self.inner.registry().channels.get(table) {
            None => ChannelState::Unsubscribed,
            Some(channel) if channel.handle.is_connected() => ChannelState::Subscribed,
            Some(_) => ChannelState::Subscribing,
        }
    }

    pub fn listener_count(&self, table: &str) -> usize {
        self.inner
            .registry()
            .channels
            .get(table)
            .map_or(0, |channel| channel.listeners.len())
    }

    /// Tables with an open channel, sorted.
    pub fn open_channels(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.inner.registry().channels.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Close every channel and drop every listener.
    pub fn cleanup(&self) {
        let channels: Vec<(String, TableChannel)> =
            self.inner.registry().channels.drain().collect();
        for (table, channel) in &channels {
            channel.handle.close();
            debug!(table = %table, "Closed live channel on cleanup");
        }
        if !channels.is_empty() {
            info!(closed = channels.len(), "Change synchronizer cleaned up");
        }
    }
}

/// One listener registration. Unsubscribing twice is a no-op.
#[must_use = "dropping a Subscription keeps the listener registered; call unsubscribe()"]
#[derive(Debug, Clone)]
pub struct Subscription {
    inner: Weak<Inner>,
    table: String,
    id: u64,
}

impl Subscription {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(&self.table, self.id);
        }
    }
}

/// Registrations created by one multi-table subscribe.
#[must_use = "dropping a MultiSubscription keeps the listeners registered; call unsubscribe()"]
#[derive(Debug, Clone)]
pub struct MultiSubscription {
    subscriptions: Vec<Subscription>,
}

impl MultiSubscription {
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(Subscription::table)
    }

    pub fn unsubscribe(&self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("tracked", &self.tracked)
            .finish_non_exhaustive()
    }
}
