//! TTL expiration scanning.
//!
//! Buckets that declare a TTL register here. A background worker wakes at
//! the configured interval and asks each registered bucket server to purge
//! records whose `_expiresAt` has passed. Purges go through the normal
//! delete path, so they maintain indexes, emit `deleted` events, and wake
//! reactive queries.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bucket::BucketHandle;
use crate::record::now_ms;

/// Registry of TTL-enabled buckets plus the interval worker.
pub(crate) struct TtlManager {
    buckets: Arc<DashMap<String, BucketHandle>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl TtlManager {
    /// Start the manager. A zero interval disables automatic scanning;
    /// manual purges remain available.
    pub(crate) fn start(interval: Duration) -> Self {
        let buckets: Arc<DashMap<String, BucketHandle>> = Arc::new(DashMap::new());
        let stop = if interval.is_zero() {
            None
        } else {
            let (stop_tx, mut stop_rx) = oneshot::channel();
            let registry = Arc::clone(&buckets);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick of a tokio interval fires immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let purged = purge_all(&registry).await;
                            if purged > 0 {
                                debug!(purged, "ttl scan purged expired records");
                            }
                        }
                        _ = &mut stop_rx => break,
                    }
                }
            });
            Some(stop_tx)
        };

        Self {
            buckets,
            stop: Mutex::new(stop),
        }
    }

    /// Register a TTL bucket.
    pub(crate) fn register(&self, handle: BucketHandle) {
        self.buckets.insert(handle.name().to_string(), handle);
    }

    /// Remove a bucket from scanning.
    pub(crate) fn unregister(&self, name: &str) {
        self.buckets.remove(name);
    }

    /// Number of registered TTL buckets.
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Purge every registered bucket now. Returns the total purged count.
    pub(crate) async fn purge_now(&self) -> usize {
        purge_all(&self.buckets).await
    }

    /// Stop the interval worker. Registered buckets stay available for
    /// manual purges.
    pub(crate) fn stop(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

async fn purge_all(registry: &DashMap<String, BucketHandle>) -> usize {
    let handles: Vec<BucketHandle> = registry.iter().map(|e| e.value().clone()).collect();
    let now = now_ms();
    let mut total = 0;
    for handle in handles {
        match handle.purge_expired(now).await {
            Ok(purged) => total += purged,
            // The bucket may have been dropped between snapshot and call.
            Err(e) => warn!(bucket = %handle.name(), error = %e, "ttl purge failed"),
        }
    }
    total
}
