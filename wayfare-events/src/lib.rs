//! Wayfare Events - cross-context invalidation broadcaster
//!
//! Every execution context attached to an origin owns exactly one
//! [`SyncBroadcaster`]. A mutation anywhere calls `trigger_sync`; listeners in
//! the same context run immediately and every other context is notified
//! through the origin's storage-change notifications.
//!
//! ```text
//!  context A                       origin storage                 context B
//!  trigger_sync ──► write signal key ──────────► watcher task ──► listeners
//!       └──► local listeners
//! ```

mod broadcaster;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::warn;
use wayfare_core::{system_clock, BroadcastSettings, ContextId, ContextStorage};

pub use broadcaster::{Subscription, SyncBroadcaster, SyncListener};

static REGISTRY: Lazy<Mutex<HashMap<ContextId, Arc<SyncBroadcaster>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<ContextId, Arc<SyncBroadcaster>>> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The broadcaster of the context `storage` belongs to.
///
/// The first call for a context creates the broadcaster and starts its
/// watcher. The registry keeps it alive, so every later call returns the
/// same instance until [`SyncBroadcaster::teardown`] releases it; call that
/// when the context goes away. `settings` only applies on creation.
pub fn broadcaster_for(
    storage: &ContextStorage,
    settings: &BroadcastSettings,
) -> Arc<SyncBroadcaster> {
    let mut registry = registry();
    if let Some(existing) = registry.get(&storage.context_id()) {
        return Arc::clone(existing);
    }

    let broadcaster = Arc::new(SyncBroadcaster::new(
        storage.clone(),
        settings,
        system_clock(),
    ));
    if let Err(e) = broadcaster.init() {
        warn!(
            context = %storage.context_id(),
            error = %e,
            "Broadcaster created without cross-context watcher"
        );
    }
    registry.insert(storage.context_id(), Arc::clone(&broadcaster));
    broadcaster
}

/// Forget the registered broadcaster of `context` if it is `broadcaster`.
pub(crate) fn unregister(context: ContextId, broadcaster: &SyncBroadcaster) {
    let removed = {
        let mut registry = registry();
        let registered = registry
            .get(&context)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), broadcaster));
        if registered {
            registry.remove(&context)
        } else {
            None
        }
    };
    drop(removed);
}
