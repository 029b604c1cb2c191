//! The recording read façade for reactive queries.
//!
//! Query functions read buckets through a `QueryContext`. Every method
//! records what it touched before delegating: survey reads (`all`, `find`,
//! `count`, aggregates, pagination) record a bucket-level dependency,
//! `get` records a record-level `(bucket, key)` dependency. The recorded
//! set becomes the subscription's dependency set for invalidation.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::bucket::{BucketHandle, Page, PageRequest};
use crate::error::Error;
use crate::events::Event;
use crate::filter::Filter;
use crate::record::Record;
use crate::value::Key;

/// The buckets and `(bucket, key)` pairs one query execution read.
#[derive(Debug, Default, Clone)]
pub struct DependencySet {
    /// Bucket-level dependencies: any change to the bucket invalidates.
    buckets: HashSet<String>,
    /// Record-level dependencies: only changes to that key invalidate.
    keys: HashSet<(String, Key)>,
}

impl DependencySet {
    /// Record a survey read.
    pub fn record_bucket(&mut self, bucket: &str) {
        self.buckets.insert(bucket.to_string());
    }

    /// Record a get-by-key read.
    pub fn record_key(&mut self, bucket: &str, key: Key) {
        self.keys.insert((bucket.to_string(), key));
    }

    /// Whether an event intersects this set.
    pub fn is_affected(&self, event: &Event) -> bool {
        if self.buckets.contains(&event.bucket) {
            return true;
        }
        self.keys
            .contains(&(event.bucket.clone(), event.key.clone()))
    }

    /// Drop every dependency on a bucket (bucket teardown).
    pub fn prune_bucket(&mut self, bucket: &str) {
        self.buckets.remove(bucket);
        self.keys.retain(|(b, _)| b != bucket);
    }

    /// Bucket names this set depends on, for diagnostics.
    pub fn bucket_names(&self) -> BTreeSet<&str> {
        self.buckets
            .iter()
            .map(String::as_str)
            .chain(self.keys.iter().map(|(b, _)| b.as_str()))
            .collect()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.keys.is_empty()
    }
}

/// Read-only façade over the store's buckets handed to query functions.
#[derive(Clone)]
pub struct QueryContext {
    buckets: Arc<DashMap<String, BucketHandle>>,
    /// Absent for one-shot `run_query` executions.
    recorder: Option<Arc<Mutex<DependencySet>>>,
}

impl QueryContext {
    pub(crate) fn recording(
        buckets: Arc<DashMap<String, BucketHandle>>,
        recorder: Arc<Mutex<DependencySet>>,
    ) -> Self {
        Self {
            buckets,
            recorder: Some(recorder),
        }
    }

    pub(crate) fn one_shot(buckets: Arc<DashMap<String, BucketHandle>>) -> Self {
        Self {
            buckets,
            recorder: None,
        }
    }

    /// A recording read view of one bucket.
    pub fn bucket(&self, name: &str) -> Result<QueryBucket, Error> {
        let handle = self
            .buckets
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::BucketNotDefined {
                name: name.to_string(),
            })?;
        Ok(QueryBucket {
            handle,
            recorder: self.recorder.clone(),
        })
    }
}

/// Recording read surface over one bucket.
pub struct QueryBucket {
    handle: BucketHandle,
    recorder: Option<Arc<Mutex<DependencySet>>>,
}

impl QueryBucket {
    fn tap_bucket(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.lock().record_bucket(self.handle.name());
        }
    }

    fn tap_key(&self, key: &Key) {
        if let Some(recorder) = &self.recorder {
            recorder.lock().record_key(self.handle.name(), key.clone());
        }
    }

    /// Get by key; records a record-level dependency.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Record>, Error> {
        let key = key.into();
        self.tap_key(&key);
        self.handle.get(key).await
    }

    /// All records; records a bucket-level dependency.
    pub async fn all(&self) -> Result<Vec<Record>, Error> {
        self.tap_bucket();
        self.handle.all().await
    }

    /// Filtered records; records a bucket-level dependency.
    pub async fn find(&self, filter: Filter) -> Result<Vec<Record>, Error> {
        self.tap_bucket();
        self.handle.find(filter).await
    }

    /// First filtered record; records a bucket-level dependency.
    pub async fn find_one(&self, filter: Filter) -> Result<Option<Record>, Error> {
        self.tap_bucket();
        self.handle.find_one(filter).await
    }

    /// Count; records a bucket-level dependency.
    pub async fn count(&self, filter: Filter) -> Result<usize, Error> {
        self.tap_bucket();
        self.handle.count(filter).await
    }

    /// First `n`; records a bucket-level dependency.
    pub async fn first(&self, n: usize) -> Result<Vec<Record>, Error> {
        self.tap_bucket();
        self.handle.first(n).await
    }

    /// Last `n`; records a bucket-level dependency.
    pub async fn last(&self, n: usize) -> Result<Vec<Record>, Error> {
        self.tap_bucket();
        self.handle.last(n).await
    }

    /// Pagination; records a bucket-level dependency.
    pub async fn paginate(&self, request: PageRequest, filter: Filter) -> Result<Page, Error> {
        self.tap_bucket();
        self.handle.paginate(request, filter).await
    }

    /// Sum aggregate; records a bucket-level dependency.
    pub async fn sum(&self, field: &str, filter: Filter) -> Result<f64, Error> {
        self.tap_bucket();
        self.handle.sum(field, filter).await
    }

    /// Average aggregate; records a bucket-level dependency.
    pub async fn avg(&self, field: &str, filter: Filter) -> Result<f64, Error> {
        self.tap_bucket();
        self.handle.avg(field, filter).await
    }

    /// Minimum aggregate; records a bucket-level dependency.
    pub async fn min(&self, field: &str, filter: Filter) -> Result<Option<f64>, Error> {
        self.tap_bucket();
        self.handle.min(field, filter).await
    }

    /// Maximum aggregate; records a bucket-level dependency.
    pub async fn max(&self, field: &str, filter: Filter) -> Result<Option<f64>, Error> {
        self.tap_bucket();
        self.handle.max(field, filter).await
    }
}
