//! Durable per-origin storage.
//!
//! An [`Origin`] is the storage scope shared by every execution context of
//! the application: one synchronous key/value [`DurableStore`] plus a change
//! notification channel. Each context attaches to the origin and gets a
//! [`ContextStorage`] handle. Writes made through a handle are published to
//! every *other* attached context; the writer never observes its own writes,
//! matching the native cross-context storage notification.
//!
//! Notifications are last-write-wins. A watcher that falls behind gets a
//! [`StorageNotice::Lagged`] instead of the missed events and is expected to
//! re-read the keys it cares about.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::error::{StorageError, StorageResult};
use crate::types::ContextId;

/// Buffered notifications per watcher before it starts lagging.
const NOTIFICATION_CAPACITY: usize = 256;

/// Synchronous key/value storage backend.
///
/// Implementations must be safe to share between contexts; concurrent writers
/// to the same key simply overwrite each other.
pub trait DurableStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get_item(&self, key: &str) -> StorageResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> StorageResult<()>;

    /// List every stored key.
    fn keys(&self) -> StorageResult<Vec<String>>;
}

/// In-memory backend with an optional byte quota.
///
/// The quota counts key plus value bytes across all entries, the way browser
/// storage enforces its per-origin limit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes once `limit` bytes are in use.
    pub fn with_quota(limit: usize) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            quota_bytes: Some(limit),
        }
    }

    /// Bytes currently in use.
    pub fn used_bytes(&self) -> usize {
        self.items
            .read()
            .map(|items| items.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }
}

impl DurableStore for MemoryStore {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        let items = self.items.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut items = self.items.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(limit) = self.quota_bytes {
            let others: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = others + key.len() + value.len();
            if needed > limit {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    limit,
                });
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        let mut items = self.items.write().map_err(|_| StorageError::LockPoisoned)?;
        items.remove(key);
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let items = self.items.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(items.keys().cloned().collect())
    }
}

/// A change made to one key by one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    pub source: ContextId,
}

/// What a [`StorageWatcher`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageNotice {
    /// Another context changed a key.
    Changed(StorageEvent),
    /// The watcher missed this many notifications. Re-read keys of interest.
    Lagged(u64),
}

/// Storage scope shared by all execution contexts of one application origin.
pub struct Origin {
    store: Arc<dyn DurableStore>,
    events: broadcast::Sender<StorageEvent>,
}

impl Origin {
    /// Create an origin over the given backend.
    pub fn new(store: Arc<dyn DurableStore>) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self { store, events })
    }

    /// Create an origin backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Arc<Self> {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Attach a new execution context to this origin.
    pub fn attach(self: &Arc<Self>) -> ContextStorage {
        ContextStorage {
            origin: Arc::clone(self),
            context_id: ContextId::new(),
        }
    }

    /// The underlying backend.
    pub fn store(&self) -> &dyn DurableStore {
        self.store.as_ref()
    }

    fn publish(&self, event: StorageEvent) {
        // No attached watchers is fine.
        let _ = self.events.send(event);
    }
}

/// One execution context's view of its origin's storage.
#[derive(Clone)]
pub struct ContextStorage {
    origin: Arc<Origin>,
    context_id: ContextId,
}

impl ContextStorage {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }

    pub fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        self.origin.store.get_item(key)
    }

    /// Write `value` and notify other contexts if the stored value changed.
    pub fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let old_value = self.origin.store.get_item(key).ok().flatten();
        self.origin.store.set_item(key, value)?;
        if old_value.as_deref() != Some(value) {
            self.origin.publish(StorageEvent {
                key: key.to_string(),
                old_value,
                new_value: Some(value.to_string()),
                source: self.context_id,
            });
        }
        Ok(())
    }

    /// Remove `key` and notify other contexts if it existed.
    pub fn remove_item(&self, key: &str) -> StorageResult<()> {
        let old_value = self.origin.store.get_item(key).ok().flatten();
        self.origin.store.remove_item(key)?;
        if old_value.is_some() {
            self.origin.publish(StorageEvent {
                key: key.to_string(),
                old_value,
                new_value: None,
                source: self.context_id,
            });
        }
        Ok(())
    }

    /// Start observing writes made by other contexts.
    pub fn watch(&self) -> StorageWatcher {
        StorageWatcher {
            rx: self.origin.events.subscribe(),
            context_id: self.context_id,
        }
    }
}

/// Receives storage notifications from other contexts of the same origin.
pub struct StorageWatcher {
    rx: broadcast::Receiver<StorageEvent>,
    context_id: ContextId,
}

impl StorageWatcher {
    /// Wait for the next foreign change. Returns `None` once the origin is gone.
    pub async fn recv(&mut self) -> Option<StorageNotice> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.source == self.context_id => continue,
                Ok(event) => return Some(StorageNotice::Changed(event)),
                Err(RecvError::Lagged(missed)) => return Some(StorageNotice::Lagged(missed)),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<StorageNotice> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.source == self.context_id => continue,
                Ok(event) => return Some(StorageNotice::Changed(event)),
                Err(TryRecvError::Lagged(missed)) => return Some(StorageNotice::Lagged(missed)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
