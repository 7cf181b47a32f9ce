//! Cache behavior across reloads, shared origins and remote reads.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};
use wayfare_core::{Clock, DurableStore, Origin, TtlPolicy};
use wayfare_storage::{CacheConfig, CachedQueries, ExpiringCache, LmdbStore, QueryOperation};
use wayfare_test_utils::assertions::{assert_cache_hit, assert_cache_miss};
use wayfare_test_utils::generators::arb_table_name;
use wayfare_test_utils::{failing_origin, fixtures, ManualClock};

fn config() -> CacheConfig {
    CacheConfig::new()
        .with_max_entries(3)
        .with_ttl(Duration::from_secs(60))
        .with_snapshot_key("test.query-cache")
}

#[test]
fn reload_restores_live_entries_only() {
    let origin = Origin::in_memory();
    let clock = ManualClock::default();

    let cache: ExpiringCache<Value> =
        ExpiringCache::with_clock(config(), origin.attach(), clock.shared());
    cache.set("short", json!("a"), Some(Duration::from_millis(100)));
    cache.set("long", json!({"rows": [1, 2]}), None);
    drop(cache);

    clock.advance(Duration::from_millis(150));
    let reloaded: ExpiringCache<Value> =
        ExpiringCache::with_clock(config(), origin.attach(), clock.shared());
    assert_eq!(reloaded.get("short"), None);
    assert_eq!(reloaded.get("long"), Some(json!({"rows": [1, 2]})));
}

#[test]
fn eviction_drops_oldest_first() {
    let clock = ManualClock::default();
    let cache: ExpiringCache<Value> = ExpiringCache::ephemeral(config(), clock.shared());

    for key in ["a", "b", "c", "d"] {
        cache.set(key, json!(key), None);
        clock.advance(Duration::from_millis(10));
    }

    assert_eq!(cache.len(), 3);
    assert!(!cache.has("a"));
    assert_eq!(cache.keys(), vec!["b", "c", "d"]);
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn unusable_storage_never_breaks_the_cache() {
    let origin = failing_origin();
    let cache: ExpiringCache<Value> = ExpiringCache::new(config(), origin.attach());
    cache.set("k", json!(1), None);
    assert_eq!(cache.get("k"), Some(json!(1)));
}

#[test]
fn malformed_snapshot_starts_empty() {
    let origin = Origin::in_memory();
    origin
        .store()
        .set_item("test.query-cache", "{\"version\":1,\"entries\":\"nope\"}")
        .unwrap();
    let cache: ExpiringCache<Value> = ExpiringCache::new(config(), origin.attach());
    assert!(cache.is_empty());
}

#[test]
fn lmdb_backed_cache_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let clock = ManualClock::default();
    {
        let store = LmdbStore::open(dir.path(), 10).unwrap();
        let origin = Origin::new(Arc::new(store));
        let cache: ExpiringCache<Value> =
            ExpiringCache::with_clock(config(), origin.attach(), clock.shared());
        cache.set("destinations_getAll_{}", json!([{"id": 1}]), None);
    }

    let store = LmdbStore::open(dir.path(), 10).unwrap();
    let origin = Origin::new(Arc::new(store));
    let cache: ExpiringCache<Value> =
        ExpiringCache::with_clock(config(), origin.attach(), clock.shared());
    assert_eq!(cache.get("destinations_getAll_{}"), Some(json!([{"id": 1}])));
}

#[tokio::test]
async fn cached_queries_respect_per_operation_ttl() {
    let clock = ManualClock::default();
    let cache = Arc::new(ExpiringCache::ephemeral(CacheConfig::new(), clock.shared()));
    let ttl = TtlPolicy {
        all_records_ms: 600_000,
        top_n_ms: 600_000,
        by_id_ms: 120_000,
    };
    let queries = CachedQueries::new(cache, fixtures::sample_remote(), ttl);

    assert_cache_miss(&queries.get_all("destinations").await.unwrap());
    assert_cache_miss(&queries.get_by_id("destinations", &json!(2)).await.unwrap());

    clock.advance(Duration::from_secs(180));
    assert_cache_hit(&queries.get_all("destinations").await.unwrap());
    let by_id = queries.get_by_id("destinations", &json!(2)).await.unwrap();
    assert_cache_miss(&by_id);
    assert_eq!(by_id.value().as_ref().unwrap()["name"], json!("Harbour"));

    assert_eq!(queries.remote().reads(), 3);
    let metrics = queries.metrics().snapshot(QueryOperation::GetById);
    assert_eq!(metrics.calls, 2);
    assert_eq!(metrics.cache_hits, 0);
}

#[tokio::test]
async fn cache_hit_reports_original_timestamp() {
    let clock = ManualClock::default();
    let cache = Arc::new(ExpiringCache::ephemeral(CacheConfig::new(), clock.shared()));
    let queries = CachedQueries::new(cache, fixtures::sample_remote(), TtlPolicy::default());

    let first = queries.get_top_n("destinations", "rating", 3).await.unwrap();
    clock.advance(Duration::from_secs(30));
    let second = queries.get_top_n("destinations", "rating", 3).await.unwrap();

    assert_eq!(second.cached_at(), first.cached_at());
    assert_eq!(second.staleness(clock.now()), Duration::from_secs(30));
}

proptest! {
    #[test]
    fn invalidate_table_drops_every_query_of_that_table(
        table in arb_table_name(),
        limit in 1u32..50,
    ) {
        let clock = ManualClock::default();
        let cache: ExpiringCache<Value> = ExpiringCache::ephemeral(
            CacheConfig::new().with_max_entries(10),
            clock.shared(),
        );
        let keys = [
            ExpiringCache::<Value>::generate_key(&table, "getAll", &json!({})),
            ExpiringCache::<Value>::generate_key(&table, "getTopN", &json!({"field": "order_position", "limit": limit})),
            ExpiringCache::<Value>::generate_key(&table, "top_rated", &json!({"limit": limit})),
        ];
        for key in &keys {
            cache.set(key.clone(), json!([]), None);
        }
        let other_table_key = "logs9_getAll_{}";
        cache.set(other_table_key, json!([]), None);

        prop_assert_eq!(cache.invalidate_table(&table), keys.len());
        prop_assert!(keys.iter().all(|key| !cache.has(key)));
        prop_assert!(cache.has(other_table_key));
    }
}
