//! View-level subscriptions over the synchronizer.
//!
//! These add no state of their own beyond a cached connectivity flag: each
//! is a call-through to [`ChangeSynchronizer`] plus a field filter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use wayfare_core::ChangeRecord;

use crate::synchronizer::{ChangeSynchronizer, MultiSubscription, Subscription};

/// Live subscription to several tables, owned by one view.
///
/// Exposes whether every table's channel is connected, recomputed on a
/// fixed interval rather than per event. Dropping the guard unsubscribes.
pub struct LiveUpdates {
    sync: ChangeSynchronizer,
    tables: Vec<String>,
    subscription: MultiSubscription,
    connected: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
}

impl LiveUpdates {
    /// Subscribe `callback` to `tables` and start polling connectivity.
    ///
    /// Outside a Tokio runtime no poller runs; call
    /// [`refresh_connectivity`](Self::refresh_connectivity) instead.
    pub fn new<I, S, F>(
        sync: &ChangeSynchronizer,
        tables: I,
        poll_interval: Duration,
        callback: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&ChangeRecord) + Send + Sync + 'static,
    {
        let tables: Vec<String> = tables.into_iter().map(Into::into).collect();
        let subscription = sync.subscribe_to_multiple_tables(&tables, callback);
        let connected = Arc::new(AtomicBool::new(all_connected(sync, &tables)));

        let poller = Handle::try_current().ok().map(|handle| {
            let sync = sync.clone();
            let tables = tables.clone();
            let connected = Arc::clone(&connected);
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let now = all_connected(&sync, &tables);
                    if connected.swap(now, Ordering::SeqCst) != now {
                        debug!(tables = ?tables, connected = now, "Live connectivity changed");
                    }
                }
            })
        });

        Self {
            sync: sync.clone(),
            tables,
            subscription,
            connected,
            poller,
        }
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Connectivity as of the last poll.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Recompute connectivity now.
    pub fn refresh_connectivity(&self) -> bool {
        let now = all_connected(&self.sync, &self.tables);
        self.connected.store(now, Ordering::SeqCst);
        now
    }
}

impl Drop for LiveUpdates {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.subscription.unsubscribe();
    }
}

/// True when every table has a connected channel. No tables means not live.
fn all_connected(sync: &ChangeSynchronizer, tables: &[String]) -> bool {
    let status = sync.get_subscription_status();
    !tables.is_empty()
        && tables
            .iter()
            .all(|table| status.get(table).copied().unwrap_or(false))
}

/// Call `callback` only for changes that touch the ranking field.
pub fn subscribe_to_ranking_changes<F>(
    sync: &ChangeSynchronizer,
    table: &str,
    callback: F,
) -> Subscription
where
    F: Fn(&ChangeRecord) + Send + Sync + 'static,
{
    let field = sync.ranking_field().to_string();
    subscribe_to_field(sync, table, field, callback)
}

/// Call `callback` only for changes that touch the ordering field.
pub fn subscribe_to_ordering_changes<F>(
    sync: &ChangeSynchronizer,
    table: &str,
    callback: F,
) -> Subscription
where
    F: Fn(&ChangeRecord) + Send + Sync + 'static,
{
    let field = sync.ordering_field().to_string();
    subscribe_to_field(sync, table, field, callback)
}

fn subscribe_to_field<F>(
    sync: &ChangeSynchronizer,
    table: &str,
    field: String,
    callback: F,
) -> Subscription
where
    F: Fn(&ChangeRecord) + Send + Sync + 'static,
{
    sync.subscribe_to_data_changes(table, move |record| {
        if record.touches(&field) {
            callback(record);
        }
    })
}
