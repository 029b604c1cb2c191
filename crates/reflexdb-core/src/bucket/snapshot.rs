//! Bucket snapshots for the persistence adapter.
//!
//! The blob handed to the adapter is opaque JSON; restore reproduces
//! records verbatim (metadata included) and the autoincrement counter.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::record::Record;

/// A point-in-time copy of one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSnapshot {
    /// Bucket name, for identity checks at restore.
    pub bucket: String,
    /// The primary key field the records were stored under.
    pub key_field: String,
    /// Autoincrement counter at snapshot time.
    pub autoincrement: i64,
    /// All records, in canonical order.
    pub records: Vec<Record>,
}

impl BucketSnapshot {
    /// Serialize to an adapter blob.
    pub fn to_blob(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::Persistence(e.to_string()))
    }

    /// Deserialize from an adapter blob.
    pub fn from_blob(blob: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(blob).map_err(|e| Error::Persistence(e.to_string()))
    }
}
