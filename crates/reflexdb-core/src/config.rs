//! Store configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::persist::SnapshotStore;

/// Options for [`Store::start`](crate::Store::start).
#[derive(Clone)]
pub struct StoreOptions {
    /// Store name, used in logs.
    pub name: String,
    /// Cadence of automatic TTL scans. Zero disables the scanner; manual
    /// purges keep working.
    pub ttl_check_interval: Duration,
    /// Snapshot adapter. `None` disables persistence entirely.
    pub persistence: Option<Arc<dyn SnapshotStore>>,
    /// Cadence of debounced background snapshots. Zero leaves only the
    /// shutdown flush.
    pub snapshot_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            name: "reflexdb".to_string(),
            ttl_check_interval: Duration::from_secs(1),
            persistence: None,
            snapshot_interval: Duration::from_secs(30),
        }
    }
}

impl StoreOptions {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the TTL scan cadence (zero disables).
    pub fn ttl_check_interval(mut self, interval: Duration) -> Self {
        self.ttl_check_interval = interval;
        self
    }

    /// Attach a persistence adapter.
    pub fn persistence(mut self, adapter: Arc<dyn SnapshotStore>) -> Self {
        self.persistence = Some(adapter);
        self
    }

    /// Set the background snapshot cadence (zero disables).
    pub fn snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }
}
