//! Broadcaster behavior across execution contexts of one origin.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::mpsc;
use wayfare_core::{BroadcastSettings, ChangeAction, Clock, Origin};
use wayfare_events::{broadcaster_for, SyncBroadcaster};
use wayfare_test_utils::generators::{arb_change_action, arb_table_name};
use wayfare_test_utils::{failing_origin, fixtures, ManualClock};

fn settings() -> BroadcastSettings {
    fixtures::test_config().broadcast
}

#[tokio::test]
async fn every_other_context_observes_the_latest_signal() {
    let origin = Origin::in_memory();
    let writer = broadcaster_for(&origin.attach(), &settings());
    let readers: Vec<Arc<SyncBroadcaster>> = (0..3)
        .map(|_| broadcaster_for(&origin.attach(), &settings()))
        .collect();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subs: Vec<_> = readers
        .iter()
        .enumerate()
        .map(|(i, reader)| {
            let tx = tx.clone();
            reader.subscribe(move || {
                let _ = tx.send(i);
            })
        })
        .collect();

    writer.trigger_sync("reviews", ChangeAction::Create);

    let mut seen = Vec::new();
    for _ in 0..readers.len() {
        let i = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("every reader is notified")
            .unwrap();
        seen.push(i);
    }
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2]);

    for reader in &readers {
        assert_eq!(reader.last_sync_trigger(), writer.last_sync_trigger());
        assert_eq!(reader.latest_signal().unwrap().table, "reviews");
        reader.teardown();
    }
    writer.teardown();
}

#[test]
fn signal_carries_clock_timestamp() {
    let origin = Origin::in_memory();
    let clock = ManualClock::default();
    let b = SyncBroadcaster::new(origin.attach(), &settings(), clock.shared());

    b.trigger_sync("destinations", ChangeAction::Delete);
    let signal = b.latest_signal().unwrap();
    assert_eq!(signal.timestamp, clock.now().timestamp_millis());
    assert_eq!(signal.action, ChangeAction::Delete);
}

#[test]
fn disabled_storage_keeps_local_delivery() {
    let origin = failing_origin();
    let b = SyncBroadcaster::new(origin.attach(), &settings(), ManualClock::default().shared());
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let _sub = b.subscribe(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });

    b.trigger_sync("destinations", ChangeAction::Update);
    b.trigger_sync("destinations", ChangeAction::Update);
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert!(b.latest_signal().is_none());
}

#[tokio::test]
async fn torn_down_context_stops_listening() {
    let origin = Origin::in_memory();
    let writer = SyncBroadcaster::new(origin.attach(), &settings(), ManualClock::default().shared());
    let reader = SyncBroadcaster::new(origin.attach(), &settings(), ManualClock::default().shared());
    reader.init().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let _sub = reader.subscribe(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    reader.teardown();

    writer.trigger_sync("tours", ChangeAction::Create);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(reader.last_sync_trigger(), 0);
}

proptest! {
    #[test]
    fn stored_signal_describes_the_last_trigger(
        triggers in proptest::collection::vec((arb_table_name(), arb_change_action()), 1..8),
    ) {
        let origin = Origin::in_memory();
        let writer = SyncBroadcaster::new(origin.attach(), &settings(), ManualClock::default().shared());
        let reader = SyncBroadcaster::new(origin.attach(), &settings(), ManualClock::default().shared());

        for (table, action) in &triggers {
            writer.trigger_sync(table, *action);
        }

        let (table, action) = triggers.last().unwrap();
        let signal = reader.latest_signal().unwrap();
        prop_assert_eq!(&signal.table, table);
        prop_assert_eq!(signal.action, *action);
        prop_assert_eq!(signal.nonce, writer.last_sync_trigger());
        prop_assert_ne!(signal.nonce, 0);
    }
}
