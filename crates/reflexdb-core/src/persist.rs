//! Persistence: the adapter contract and the snapshot flusher.
//!
//! Adapters store opaque blobs keyed by bucket name; the store never
//! assumes anything about where they live. A background worker snapshots
//! registered persistent buckets on a debounced cadence; failures are
//! logged and retried on the next cycle. The bundled memory adapter backs
//! tests and in-process embedding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bucket::BucketHandle;
use crate::error::Error;

/// Blob storage contract for bucket snapshots.
///
/// Snapshot shape is the store's concern; adapters move bytes.
pub trait SnapshotStore: Send + Sync {
    /// Read the blob for a bucket, if one was ever written.
    fn read(&self, bucket: &str) -> Result<Option<Vec<u8>>, Error>;
    /// Write (replace) the blob for a bucket.
    fn write(&self, bucket: &str, blob: Vec<u8>) -> Result<(), Error>;
    /// Forget the blob for a bucket.
    fn delete(&self, bucket: &str) -> Result<(), Error>;
}

/// In-memory adapter.
#[derive(Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Whether no blob is stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn read(&self, bucket: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.blobs.lock().get(bucket).cloned())
    }

    fn write(&self, bucket: &str, blob: Vec<u8>) -> Result<(), Error> {
        self.blobs.lock().insert(bucket.to_string(), blob);
        Ok(())
    }

    fn delete(&self, bucket: &str) -> Result<(), Error> {
        self.blobs.lock().remove(bucket);
        Ok(())
    }
}

/// Registry of persistent buckets plus the debounced flush worker.
pub(crate) struct PersistenceManager {
    adapter: Arc<dyn SnapshotStore>,
    buckets: Arc<DashMap<String, BucketHandle>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl PersistenceManager {
    /// Start the manager. A zero interval disables the background worker;
    /// the shutdown flush still runs.
    pub(crate) fn start(adapter: Arc<dyn SnapshotStore>, interval: Duration) -> Self {
        let buckets: Arc<DashMap<String, BucketHandle>> = Arc::new(DashMap::new());
        let stop = if interval.is_zero() {
            None
        } else {
            let (stop_tx, mut stop_rx) = oneshot::channel();
            let registry = Arc::clone(&buckets);
            let adapter_clone = Arc::clone(&adapter);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            flush_all(&adapter_clone, &registry).await;
                        }
                        _ = &mut stop_rx => break,
                    }
                }
            });
            Some(stop_tx)
        };

        Self {
            adapter,
            buckets,
            stop: Mutex::new(stop),
        }
    }

    /// Load the stored snapshot blob for a bucket, if any.
    pub(crate) fn load(&self, bucket: &str) -> Result<Option<Vec<u8>>, Error> {
        self.adapter.read(bucket)
    }

    /// Register a bucket for periodic snapshots.
    pub(crate) fn register(&self, handle: BucketHandle) {
        self.buckets.insert(handle.name().to_string(), handle);
    }

    /// Stop snapshotting a bucket and forget its stored blob.
    pub(crate) fn unregister(&self, name: &str) {
        self.buckets.remove(name);
        if let Err(e) = self.adapter.delete(name) {
            warn!(bucket = name, error = %e, "failed to delete snapshot blob");
        }
    }

    /// Snapshot every registered bucket now.
    pub(crate) async fn flush(&self) {
        flush_all(&self.adapter, &self.buckets).await;
    }

    /// Stop the background worker.
    pub(crate) fn stop(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

async fn flush_all(adapter: &Arc<dyn SnapshotStore>, registry: &DashMap<String, BucketHandle>) {
    let handles: Vec<BucketHandle> = registry.iter().map(|e| e.value().clone()).collect();
    for handle in handles {
        let result = async {
            let snapshot = handle.snapshot().await?;
            adapter.write(handle.name(), snapshot.to_blob()?)
        }
        .await;
        match result {
            Ok(()) => debug!(bucket = %handle.name(), "snapshot flushed"),
            // Retried on the next cycle.
            Err(e) => warn!(bucket = %handle.name(), error = %e, "snapshot flush failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bucket::{self, BucketSnapshot};
    use crate::events::EventBus;
    use crate::schema::{BucketDef, FieldDef, Schema};
    use crate::value::fields;

    fn notes_bucket(bus: &EventBus) -> BucketHandle {
        let def = BucketDef::new("id").field(FieldDef::string("id").required());
        bucket::spawn(
            Arc::new(Schema::compile("notes", def).unwrap()),
            bus.clone(),
        )
    }

    #[test]
    fn test_memory_adapter_roundtrip() {
        let adapter = MemorySnapshotStore::new();
        assert_eq!(adapter.read("a").unwrap(), None);

        adapter.write("a", vec![1, 2, 3]).unwrap();
        assert_eq!(adapter.read("a").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(adapter.len(), 1);

        adapter.delete("a").unwrap();
        assert_eq!(adapter.read("a").unwrap(), None);
        assert!(adapter.is_empty());
    }

    #[tokio::test]
    async fn test_flush_writes_snapshots() {
        let bus = EventBus::new();
        let notes = notes_bucket(&bus);
        notes.insert(fields([("id", "a".into())])).await.unwrap();

        let adapter = Arc::new(MemorySnapshotStore::new());
        let manager = PersistenceManager::start(
            Arc::clone(&adapter) as Arc<dyn SnapshotStore>,
            Duration::ZERO,
        );
        manager.register(notes.clone());

        manager.flush().await;

        let blob = adapter.read("notes").unwrap().unwrap();
        let snapshot = BucketSnapshot::from_blob(&blob).unwrap();
        assert_eq!(snapshot.records.len(), 1);

        manager.stop();
    }

    #[tokio::test]
    async fn test_interval_worker_flushes() {
        let bus = EventBus::new();
        let notes = notes_bucket(&bus);
        notes.insert(fields([("id", "a".into())])).await.unwrap();

        let adapter = Arc::new(MemorySnapshotStore::new());
        let manager = PersistenceManager::start(
            Arc::clone(&adapter) as Arc<dyn SnapshotStore>,
            Duration::from_millis(20),
        );
        manager.register(notes.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(adapter.read("notes").unwrap().is_some());

        manager.stop();
    }

    #[tokio::test]
    async fn test_unregister_forgets_blob() {
        let bus = EventBus::new();
        let notes = notes_bucket(&bus);

        let adapter = Arc::new(MemorySnapshotStore::new());
        let manager = PersistenceManager::start(
            Arc::clone(&adapter) as Arc<dyn SnapshotStore>,
            Duration::ZERO,
        );
        manager.register(notes.clone());
        manager.flush().await;
        assert!(adapter.read("notes").unwrap().is_some());

        manager.unregister("notes");
        assert!(adapter.read("notes").unwrap().is_none());

        manager.flush().await;
        assert!(adapter.read("notes").unwrap().is_none());
        manager.stop();
    }
}
