//! Invalidation broadcaster for one execution context.
//!
//! A mutation in any context calls [`SyncBroadcaster::trigger_sync`], which
//! overwrites the signal key in origin storage and runs this context's
//! listeners before returning. Other contexts learn about it from the
//! storage notification their watcher task receives. Signals are not queued:
//! a listener only learns that *something* changed and must re-derive its
//! view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wayfare_core::{
    call_isolated, BroadcastSettings, ChangeAction, ChannelError, ContextStorage,
    InvalidationSignal, SharedClock, StorageNotice,
};

/// Zero-argument "something changed" callback.
pub type SyncListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ListenerList {
    next_id: u64,
    /// Registration order is invocation order.
    entries: Vec<(u64, SyncListener)>,
}

struct Shared {
    storage: ContextStorage,
    signal_key: String,
    clock: SharedClock,
    listeners: Mutex<ListenerList>,
    last_seen: AtomicU64,
}

impl Shared {
    fn listeners(&self) -> MutexGuard<'_, ListenerList> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let snapshot: Vec<SyncListener> = self
            .listeners()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            call_isolated("sync-broadcaster", || (*listener)());
        }
    }

    fn read_signal(&self) -> Option<InvalidationSignal> {
        match self.storage.get_item(&self.signal_key) {
            Ok(Some(text)) => decode_signal(&self.signal_key, &text),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %self.signal_key, error = %e, "Failed to read sync signal");
                None
            }
        }
    }

    fn observe(&self, signal: Option<InvalidationSignal>) {
        if let Some(signal) = signal {
            self.last_seen.store(signal.nonce, Ordering::SeqCst);
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut list = self.listeners();
        let before = list.entries.len();
        list.entries.retain(|(entry_id, _)| *entry_id != id);
        list.entries.len() != before
    }
}

fn decode_signal(key: &str, text: &str) -> Option<InvalidationSignal> {
    match serde_json::from_str(text) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(key = %key, error = %e, "Malformed sync signal");
            None
        }
    }
}

/// Cross-context invalidation broadcaster.
///
/// Use [`broadcaster_for`](crate::broadcaster_for) to get the single
/// instance of a context; [`new`](Self::new) builds an unregistered one.
pub struct SyncBroadcaster {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncBroadcaster {
    pub fn new(storage: ContextStorage, settings: &BroadcastSettings, clock: SharedClock) -> Self {
        Self {
            shared: Arc::new(Shared {
                storage,
                signal_key: settings.signal_key.clone(),
                clock,
                listeners: Mutex::new(ListenerList::default()),
                last_seen: AtomicU64::new(0),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn signal_key(&self) -> &str {
        &self.shared.signal_key
    }

    /// Start watching the signal key for writes from other contexts.
    ///
    /// Spawns one watcher task on the current Tokio runtime. Calling this
    /// again while the watcher runs does nothing.
    pub fn init(&self) -> Result<(), ChannelError> {
        let mut watcher = self.watcher_slot();
        if watcher.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        let handle = Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

        self.shared.observe(self.shared.read_signal());
        let mut notices = self.shared.storage.watch();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        *watcher = Some(handle.spawn(async move {
            while let Some(notice) = notices.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                match notice {
                    StorageNotice::Changed(event) if event.key == shared.signal_key => {
                        let signal = event
                            .new_value
                            .as_deref()
                            .and_then(|text| decode_signal(&shared.signal_key, text));
                        debug!(
                            table = signal.as_ref().map(|s| s.table.as_str()),
                            "Sync signal from another context"
                        );
                        shared.observe(signal);
                        shared.notify();
                    }
                    StorageNotice::Changed(_) => {}
                    StorageNotice::Lagged(missed) => {
                        debug!(missed, "Storage notifications lagged, re-reading sync signal");
                        shared.observe(shared.read_signal());
                        shared.notify();
                    }
                }
            }
            debug!("Sync watcher exiting");
        }));
        info!(
            context = %self.shared.storage.context_id(),
            key = %self.shared.signal_key,
            "Sync broadcaster initialized"
        );
        Ok(())
    }

    /// Stop the watcher and drop every listener.
    ///
    /// A broadcaster obtained from [`broadcaster_for`](crate::broadcaster_for)
    /// is also released, so the next call for this context builds a new one.
    pub fn teardown(&self) {
        if let Some(task) = self.watcher_slot().take() {
            task.abort();
        }
        self.shared.listeners().entries.clear();
        crate::unregister(self.shared.storage.context_id(), self);
    }

    /// True while the cross-context watcher is running.
    pub fn is_watching(&self) -> bool {
        self.watcher_slot()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Announce a mutation of `table` to every context of the origin.
    ///
    /// Local listeners always run, even when the signal cannot be stored.
    pub fn trigger_sync(&self, table: &str, action: ChangeAction) {
        let signal = InvalidationSignal {
            table: table.to_string(),
            action,
            timestamp: self.shared.clock.now().timestamp_millis(),
            nonce: rand::rng().random_range(1..=u64::MAX),
        };

        match serde_json::to_string(&signal) {
            Ok(text) => {
                if let Err(e) = self.shared.storage.set_item(&self.shared.signal_key, &text) {
                    warn!(
                        table = %table,
                        error = %e,
                        "Failed to store sync signal, other contexts will not be notified"
                    );
                }
            }
            Err(e) => warn!(table = %table, error = %e, "Failed to encode sync signal"),
        }

        debug!(table = %table, action = %action, "Sync triggered");
        self.shared.observe(Some(signal));
        self.shared.notify();
    }

    /// Register `listener`, called on every signal from any context.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut list = self.shared.listeners();
        let id = list.next_id;
        list.next_id += 1;
        list.entries.push((id, Arc::new(listener)));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Nonce of the most recently observed signal, `0` if none yet.
    pub fn last_sync_trigger(&self) -> u64 {
        self.shared.last_seen.load(Ordering::SeqCst)
    }

    /// Re-read the signal currently stored under the signal key.
    pub fn latest_signal(&self) -> Option<InvalidationSignal> {
        self.shared.read_signal()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners().entries.len()
    }

    fn watcher_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncBroadcaster {
    fn drop(&mut self) {
        if let Some(task) = self.watcher_slot().take() {
            task.abort();
        }
    }
}

/// Registration returned by [`SyncBroadcaster::subscribe`].
///
/// The listener stays registered until `unsubscribe` or until the
/// broadcaster is torn down; after teardown this handle does nothing.
#[must_use = "dropping a Subscription keeps the listener registered; call unsubscribe()"]
#[derive(Debug, Clone)]
pub struct Subscription {
    shared: Weak<Shared>,
    id: u64,
}

impl Subscription {
    /// Remove exactly this listener. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("signal_key", &self.signal_key)
            .finish_non_exhaustive()
    }
}
