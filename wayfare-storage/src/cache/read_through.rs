//! Read-through queries over the expiring cache.
//!
//! Each query builds its cache key, serves a live entry when there is one,
//! and otherwise reads the remote store and caches the successful result
//! under the TTL its query shape is given by [`TtlPolicy`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use wayfare_core::{FetchError, Row, TtlPolicy};

use super::expiring::ExpiringCache;
use super::freshness::CacheRead;
use super::key::generate_key;
use crate::remote::RemoteStore;

/// The three cached query shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOperation {
    GetAll,
    GetById,
    GetTopN,
}

impl QueryOperation {
    pub const ALL: [QueryOperation; 3] = [Self::GetAll, Self::GetById, Self::GetTopN];

    /// Operation name used in cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetAll => "getAll",
            Self::GetById => "getById",
            Self::GetTopN => "getTopN",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::GetAll => 0,
            Self::GetById => 1,
            Self::GetTopN => 2,
        }
    }
}

impl std::fmt::Display for QueryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct OperationCounters {
    calls: AtomicU64,
    cache_hits: AtomicU64,
    remote_ok: AtomicU64,
    remote_err: AtomicU64,
    remote_latency_us: AtomicU64,
}

/// Point-in-time counters for one query operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationMetrics {
    pub calls: u64,
    pub cache_hits: u64,
    pub remote_ok: u64,
    pub remote_err: u64,
    /// Total time spent in remote reads.
    pub remote_latency: Duration,
}

impl OperationMetrics {
    /// Mean remote read latency, if any remote read happened.
    pub fn mean_remote_latency(&self) -> Option<Duration> {
        let reads = self.remote_ok + self.remote_err;
        if reads == 0 {
            return None;
        }
        u32::try_from(reads)
            .ok()
            .map(|reads| self.remote_latency / reads)
    }
}

/// Per-operation call, hit and remote-read counters.
#[derive(Debug, Default)]
pub struct QueryMetrics {
    counters: [OperationCounters; 3],
}

impl QueryMetrics {
    pub fn snapshot(&self, operation: QueryOperation) -> OperationMetrics {
        let c = &self.counters[operation.index()];
        OperationMetrics {
            calls: c.calls.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            remote_ok: c.remote_ok.load(Ordering::Relaxed),
            remote_err: c.remote_err.load(Ordering::Relaxed),
            remote_latency: Duration::from_micros(c.remote_latency_us.load(Ordering::Relaxed)),
        }
    }

    fn counters(&self, operation: QueryOperation) -> &OperationCounters {
        &self.counters[operation.index()]
    }

    fn record_remote(&self, operation: QueryOperation, elapsed: Duration, ok: bool) {
        let c = self.counters(operation);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        c.remote_latency_us.fetch_add(micros, Ordering::Relaxed);
        if ok {
            c.remote_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            c.remote_err.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Cached `getAll` / `getById` / `getTopN` queries against a remote store.
pub struct CachedQueries<R> {
    cache: Arc<ExpiringCache<Value>>,
    remote: R,
    ttl: TtlPolicy,
    metrics: QueryMetrics,
}

impl<R: RemoteStore> CachedQueries<R> {
    pub fn new(cache: Arc<ExpiringCache<Value>>, remote: R, ttl: TtlPolicy) -> Self {
        Self {
            cache,
            remote,
            ttl,
            metrics: QueryMetrics::default(),
        }
    }

    pub fn cache(&self) -> &Arc<ExpiringCache<Value>> {
        &self.cache
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn metrics(&self) -> &QueryMetrics {
        &self.metrics
    }

    /// All rows of `table`.
    pub async fn get_all(&self, table: &str) -> Result<CacheRead<Vec<Row>>, FetchError> {
        let op = QueryOperation::GetAll;
        let key = generate_key(table, op.as_str(), &json!({}));
        self.read_through(table, op, key, self.ttl.all_records(), || {
            self.remote.fetch_all(table)
        })
        .await
    }

    /// The row of `table` with this `id`. A missing row is not cached.
    pub async fn get_by_id(
        &self,
        table: &str,
        id: &Value,
    ) -> Result<CacheRead<Option<Row>>, FetchError> {
        let op = QueryOperation::GetById;
        let key = generate_key(table, op.as_str(), &json!({ "id": id }));
        self.read_through(table, op, key, self.ttl.by_id(), || {
            self.remote.fetch_by_id(table, id)
        })
        .await
    }

    /// The top `limit` rows of `table` by `field`, descending.
    pub async fn get_top_n(
        &self,
        table: &str,
        field: &str,
        limit: usize,
    ) -> Result<CacheRead<Vec<Row>>, FetchError> {
        let op = QueryOperation::GetTopN;
        let key = generate_key(table, op.as_str(), &json!({ "field": field, "limit": limit }));
        self.read_through(table, op, key, self.ttl.top_n(), || {
            self.remote.fetch_top_n(table, field, limit)
        })
        .await
    }

    async fn read_through<T, F, Fut>(
        &self,
        table: &str,
        op: QueryOperation,
        key: String,
        ttl: Duration,
        fetch: F,
    ) -> Result<CacheRead<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.metrics
            .counters(op)
            .calls
            .fetch_add(1, Ordering::Relaxed);

        if let Some((cached, stored_at)) = self.cache.get_with_timestamp(&key) {
            match serde_json::from_value::<T>(cached) {
                Ok(value) => {
                    self.metrics
                        .counters(op)
                        .cache_hits
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheRead::from_cache(value, stored_at));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                    self.cache.delete(&key);
                }
            }
        }

        let started = Instant::now();
        let result = fetch().await;
        let elapsed = started.elapsed();
        self.metrics.record_remote(op, elapsed, result.is_ok());

        let value = match result {
            Ok(value) => {
                debug!(
                    table = %table,
                    operation = %op,
                    latency_ms = elapsed.as_millis() as u64,
                    "Remote read"
                );
                value
            }
            Err(e) => {
                warn!(
                    table = %table,
                    operation = %op,
                    latency_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Remote read failed"
                );
                return Err(e);
            }
        };

        if value.should_cache() {
            match serde_json::to_value(&value) {
                Ok(encoded) => self.cache.set(key, encoded, Some(ttl)),
                Err(e) => warn!(key = %key, error = %e, "Result not cacheable"),
            }
        }
        Ok(CacheRead::from_remote(value, self.cache.now()))
    }
}

/// Decides whether a fetched result goes into the cache.
pub trait Cacheable {
    fn should_cache(&self) -> bool {
        true
    }
}

impl Cacheable for Vec<Row> {}

impl Cacheable for Option<Row> {
    fn should_cache(&self) -> bool {
        self.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::expiring::CacheConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use wayfare_core::system_clock;

    #[derive(Default)]
    struct FakeRemote {
        tables: Mutex<HashMap<String, Vec<Row>>>,
        reads: AtomicU64,
        fail: std::sync::atomic::AtomicBool,
    }

    impl FakeRemote {
        fn with_rows(table: &str, rows: Vec<Value>) -> Self {
            let remote = Self::default();
            let rows = rows
                .into_iter()
                .filter_map(|v| v.as_object().cloned())
                .collect();
            remote.tables.lock().unwrap().insert(table.to_string(), rows);
            remote
        }

        fn reads(&self) -> u64 {
            self.reads.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<(), FetchError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::Http {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteStore for FakeRemote {
        async fn fetch_all(&self, table: &str) -> Result<Vec<Row>, FetchError> {
            self.check()?;
            Ok(self.tables.lock().unwrap().get(table).cloned().unwrap_or_default())
        }

        async fn fetch_by_id(&self, table: &str, id: &Value) -> Result<Option<Row>, FetchError> {
            self.check()?;
            Ok(self
                .tables
                .lock()
                .unwrap()
                .get(table)
                .and_then(|rows| rows.iter().find(|r| r.get("id") == Some(id)).cloned()))
        }

        async fn fetch_top_n(
            &self,
            table: &str,
            field: &str,
            limit: usize,
        ) -> Result<Vec<Row>, FetchError> {
            self.check()?;
            let mut rows = self.tables.lock().unwrap().get(table).cloned().unwrap_or_default();
            rows.sort_by(|a, b| {
                let a = a.get(field).and_then(Value::as_f64).unwrap_or(f64::MIN);
                let b = b.get(field).and_then(Value::as_f64).unwrap_or(f64::MIN);
                b.total_cmp(&a)
            });
            rows.truncate(limit);
            Ok(rows)
        }
    }

    fn queries(remote: FakeRemote) -> CachedQueries<FakeRemote> {
        let cache = Arc::new(ExpiringCache::ephemeral(CacheConfig::new(), system_clock()));
        CachedQueries::new(cache, remote, TtlPolicy::default())
    }

    fn destinations() -> FakeRemote {
        FakeRemote::with_rows(
            "destinations",
            vec![
                json!({"id": 1, "name": "Old Town", "rating": 4.2}),
                json!({"id": 2, "name": "Harbour", "rating": 4.8}),
                json!({"id": 3, "name": "Castle Hill", "rating": 3.9}),
            ],
        )
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_cache() {
        let q = queries(destinations());

        let first = q.get_all("destinations").await.unwrap();
        assert!(first.was_cache_miss());
        assert_eq!(first.value().len(), 3);

        let second = q.get_all("destinations").await.unwrap();
        assert!(second.was_cache_hit());
        assert_eq!(second.value(), first.value());
        assert_eq!(q.remote().reads(), 1);

        let m = q.metrics().snapshot(QueryOperation::GetAll);
        assert_eq!(m.calls, 2);
        assert_eq!(m.cache_hits, 1);
        assert_eq!(m.remote_ok, 1);
        assert_eq!(m.remote_err, 0);
    }

    #[tokio::test]
    async fn test_missing_row_is_not_cached() {
        let q = queries(destinations());

        let missing = q.get_by_id("destinations", &json!(99)).await.unwrap();
        assert!(missing.value().is_none());
        let again = q.get_by_id("destinations", &json!(99)).await.unwrap();
        assert!(again.was_cache_miss());
        assert_eq!(q.remote().reads(), 2);

        let found = q.get_by_id("destinations", &json!(2)).await.unwrap();
        assert_eq!(found.value().as_ref().unwrap()["name"], "Harbour");
        let cached = q.get_by_id("destinations", &json!(2)).await.unwrap();
        assert!(cached.was_cache_hit());
    }

    #[tokio::test]
    async fn test_top_n_keys_depend_on_params() {
        let q = queries(destinations());

        let top2 = q.get_top_n("destinations", "rating", 2).await.unwrap();
        assert_eq!(top2.value()[0]["name"], "Harbour");
        assert_eq!(top2.value().len(), 2);

        let top1 = q.get_top_n("destinations", "rating", 1).await.unwrap();
        assert!(top1.was_cache_miss());
        assert_eq!(q.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_failures_propagate_and_are_not_cached() {
        let remote = destinations();
        remote.fail.store(true, Ordering::SeqCst);
        let q = queries(remote);

        let err = q.get_all("destinations").await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 503, .. }));
        assert!(q.cache().is_empty());

        q.remote().fail.store(false, Ordering::SeqCst);
        assert!(q.get_all("destinations").await.unwrap().was_cache_miss());

        let m = q.metrics().snapshot(QueryOperation::GetAll);
        assert_eq!(m.remote_err, 1);
        assert_eq!(m.remote_ok, 1);
        assert!(m.mean_remote_latency().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_table_forces_refetch() {
        let q = queries(destinations());
        q.get_all("destinations").await.unwrap();
        q.get_by_id("destinations", &json!(1)).await.unwrap();

        assert_eq!(q.cache().invalidate_table("destinations"), 2);
        assert!(q.get_all("destinations").await.unwrap().was_cache_miss());
    }

    #[test]
    fn test_operation_names() {
        let names: Vec<_> = QueryOperation::ALL.iter().map(|op| op.as_str()).collect();
        assert_eq!(names, ["getAll", "getById", "getTopN"]);
        assert_eq!(
            OperationMetrics::default().mean_remote_latency(),
            None
        );
    }
}
