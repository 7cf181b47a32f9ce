//! Background maintenance for the expiring cache.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::expiring::ExpiringCache;

/// Handle to a running sweeper. Dropping it stops the sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper. Calling this more than once is harmless.
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sweep `cache` every `interval` on the current Tokio runtime.
///
/// The task holds only a weak reference and exits once the cache is dropped.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime.
pub fn spawn_sweeper<T>(cache: &Arc<ExpiringCache<T>>, interval: Duration) -> SweeperHandle
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let weak: Weak<ExpiringCache<T>> = Arc::downgrade(cache);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(cache) = weak.upgrade() else {
                debug!("Cache dropped, sweeper exiting");
                break;
            };
            cache.sweep();
        }
    });
    SweeperHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::expiring::CacheConfig;
    use serde_json::{json, Value};
    use wayfare_core::{system_clock, Origin};

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_on_tick() {
        let origin = Origin::in_memory();
        let cache: Arc<ExpiringCache<Value>> = Arc::new(ExpiringCache::with_clock(
            CacheConfig::new().with_snapshot_key("sweep.cache"),
            origin.attach(),
            system_clock(),
        ));
        cache.set("k", json!(1), Some(Duration::from_millis(1)));

        let handle = spawn_sweeper(&cache, Duration::from_secs(60));
        assert!(handle.is_running());

        std::thread::sleep(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(cache.is_empty());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_exits_when_cache_dropped() {
        let cache: Arc<ExpiringCache<Value>> = Arc::new(ExpiringCache::ephemeral(
            CacheConfig::new(),
            system_clock(),
        ));
        let handle = spawn_sweeper(&cache, Duration::from_secs(1));
        drop(cache);

        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(!handle.is_running());
    }
}
