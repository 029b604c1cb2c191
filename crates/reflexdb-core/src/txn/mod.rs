//! Cross-bucket transactions.
//!
//! A transaction buffers writes per bucket and reads its own buffer before
//! the committed state. Nothing touches a bucket server until commit, which
//! runs a staged-apply protocol: every touched bucket is prepared in
//! lexicographic name order (verifying read versions, write versions,
//! primary-key collisions, and uniqueness), each prepared bucket parks its
//! mailbox until the decision arrives, and only after every bucket has
//! prepared do the commits apply. Events buffer with the writes and publish
//! as one block after the last bucket commits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::bucket::{BucketHandle, Page, PageRequest, PendingWrite, TxDecision};
use crate::error::Error;
use crate::events::EventBus;
use crate::filter::Filter;
use crate::record::Record;
use crate::value::{Fields, Key};

/// Per-bucket working set: collapsed pending writes and read versions.
/// Survey reads leave nothing here; only `get`-observed versions are
/// checked at commit.
struct WorkingSet {
    handle: BucketHandle,
    writes: HashMap<Key, PendingWrite>,
    /// First-touch order of written keys; commit applies in this order.
    order: Vec<Key>,
    /// Versions observed by `get` (0 for absent). Verified at commit.
    reads: HashMap<Key, u64>,
}

impl WorkingSet {
    fn new(handle: BucketHandle) -> Self {
        Self {
            handle,
            writes: HashMap::new(),
            order: Vec::new(),
            reads: HashMap::new(),
        }
    }

    fn writes_in_order(&self) -> Vec<(Key, PendingWrite)> {
        self.order
            .iter()
            .filter_map(|k| self.writes.get(k).map(|w| (k.clone(), w.clone())))
            .collect()
    }
}

struct TxInner {
    buckets: Arc<DashMap<String, BucketHandle>>,
    working: Mutex<BTreeMap<String, WorkingSet>>,
}

/// A transactional context. Cheap to clone; all clones share one buffer.
#[derive(Clone)]
pub struct Tx {
    inner: Arc<TxInner>,
}

impl Tx {
    pub(crate) fn new(buckets: Arc<DashMap<String, BucketHandle>>) -> Self {
        Self {
            inner: Arc::new(TxInner {
                buckets,
                working: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// A transactional view of one bucket, with the same read/write
    /// surface as a direct handle.
    pub fn bucket(&self, name: &str) -> Result<TxBucket, Error> {
        let handle = self
            .inner
            .buckets
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::BucketNotDefined {
                name: name.to_string(),
            })?;
        Ok(TxBucket {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
            handle,
        })
    }

    /// Run the staged-apply commit across every touched bucket and publish
    /// the buffered events.
    pub(crate) async fn commit(self, bus: &EventBus) -> Result<(), Error> {
        // Lexicographic acquisition order keeps concurrent commits
        // deadlock-free.
        let sets: BTreeMap<String, WorkingSet> =
            std::mem::take(&mut *self.inner.working.lock());

        let mut prepared: Vec<oneshot::Sender<TxDecision>> = Vec::new();
        for (_, set) in sets.iter() {
            if set.writes.is_empty() && set.reads.is_empty() {
                continue;
            }
            let (decision_tx, decision_rx) = oneshot::channel();
            let reads: Vec<(Key, u64)> =
                set.reads.iter().map(|(k, v)| (k.clone(), *v)).collect();
            match set
                .handle
                .prepare(set.writes_in_order(), reads, decision_rx)
                .await
            {
                Ok(()) => prepared.push(decision_tx),
                Err(e) => {
                    for decision in prepared {
                        let _ = decision.send(TxDecision::Abort);
                    }
                    return Err(e);
                }
            }
        }

        // Every bucket is prepared and parked; commits cannot fail now.
        let mut events = Vec::new();
        for decision in prepared {
            let (events_tx, events_rx) = oneshot::channel();
            let _ = decision.send(TxDecision::Commit { events: events_tx });
            if let Ok(mut produced) = events_rx.await {
                events.append(&mut produced);
            }
        }

        for event in events {
            bus.publish(event);
        }
        Ok(())
    }
}

/// What the working set holds for a key, cloned out for the caller.
enum Buffered {
    Insert {
        record: Record,
        replaces: Option<u64>,
    },
    Update {
        expected: u64,
        record: Record,
    },
    Delete {
        expected: u64,
    },
    None,
}

/// Transactional read/write surface over one bucket.
pub struct TxBucket {
    inner: Arc<TxInner>,
    name: String,
    handle: BucketHandle,
}

impl TxBucket {
    fn buffered(&self, key: &Key) -> Buffered {
        let working = self.inner.working.lock();
        match working.get(&self.name).and_then(|s| s.writes.get(key)) {
            Some(PendingWrite::Insert { record, replaces }) => Buffered::Insert {
                record: record.clone(),
                replaces: *replaces,
            },
            Some(PendingWrite::Update { expected, record }) => Buffered::Update {
                expected: *expected,
                record: record.clone(),
            },
            Some(PendingWrite::Delete { expected }) => Buffered::Delete {
                expected: *expected,
            },
            None => Buffered::None,
        }
    }

    fn with_set<T>(&self, f: impl FnOnce(&mut WorkingSet) -> T) -> T {
        let mut working = self.inner.working.lock();
        let set = working
            .entry(self.name.clone())
            .or_insert_with(|| WorkingSet::new(self.handle.clone()));
        f(set)
    }

    fn stage(&self, key: Key, write: PendingWrite) {
        self.with_set(|set| {
            if !set.writes.contains_key(&key) {
                set.order.push(key.clone());
            }
            set.writes.insert(key, write);
        });
    }

    fn not_found(&self, key: &Key) -> Error {
        Error::NotFound {
            bucket: self.name.clone(),
            key: key.clone(),
        }
    }

    fn key_of(&self, record: &Record) -> Result<Key, Error> {
        let key_field = self.handle.schema().key_field();
        record.key(key_field).ok_or_else(|| Error::InvalidDefinition {
            bucket: self.name.clone(),
            reason: format!("record has no usable key in '{key_field}'"),
        })
    }

    /// Read a record: the pending buffer first, then the committed state.
    /// Committed reads record the observed version for commit validation.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Record>, Error> {
        let key = key.into();
        match self.buffered(&key) {
            Buffered::Insert { record, .. } | Buffered::Update { record, .. } => {
                return Ok(Some(record));
            }
            Buffered::Delete { .. } => return Ok(None),
            Buffered::None => {}
        }

        let live = self.handle.get(key.clone()).await?;
        let version = live.as_ref().map(|r| r.version()).unwrap_or(0);
        self.with_set(|set| {
            set.reads.entry(key).or_insert(version);
        });
        Ok(live)
    }

    /// Buffer an insert. Validation (and generator draws) happen now; the
    /// write lands at commit.
    pub async fn insert(&self, input: Fields) -> Result<Record, Error> {
        let record = self.handle.validate_insert(input).await?;
        let key = self.key_of(&record)?;

        let duplicate = || Error::UniqueConstraint {
            bucket: self.name.clone(),
            field: self.handle.schema().key_field().to_string(),
            value: key.clone().into(),
        };

        match self.buffered(&key) {
            Buffered::Insert { .. } | Buffered::Update { .. } => return Err(duplicate()),
            Buffered::Delete { expected } => {
                // Re-insert over a record this transaction deleted: keep
                // the expected version the delete captured.
                self.stage(
                    key,
                    PendingWrite::Insert {
                        record: record.clone(),
                        replaces: Some(expected),
                    },
                );
                return Ok(record);
            }
            Buffered::None => {}
        }

        if self.handle.get(key.clone()).await?.is_some() {
            return Err(duplicate());
        }
        self.stage(
            key,
            PendingWrite::Insert {
                record: record.clone(),
                replaces: None,
            },
        );
        Ok(record)
    }

    /// Buffer an update over the pending or committed record.
    pub async fn update(&self, key: impl Into<Key>, changes: Fields) -> Result<Record, Error> {
        let key = key.into();
        match self.buffered(&key) {
            Buffered::Delete { .. } => Err(self.not_found(&key)),
            Buffered::Insert { record, replaces } => {
                // Still an insert at commit: the merged record keeps
                // version 1, it was never observable in between.
                let mut merged = self.handle.validate_update(record, changes).await?;
                merged.set_version(1);
                self.stage(
                    key,
                    PendingWrite::Insert {
                        record: merged.clone(),
                        replaces,
                    },
                );
                Ok(merged)
            }
            Buffered::Update { expected, record } => {
                let mut merged = self.handle.validate_update(record, changes).await?;
                merged.set_version(expected + 1);
                self.stage(
                    key,
                    PendingWrite::Update {
                        expected,
                        record: merged.clone(),
                    },
                );
                Ok(merged)
            }
            Buffered::None => {
                let old = self
                    .handle
                    .get(key.clone())
                    .await?
                    .ok_or_else(|| self.not_found(&key))?;
                let merged = self.handle.validate_update(old.clone(), changes).await?;
                self.stage(
                    key.clone(),
                    PendingWrite::Update {
                        expected: old.version(),
                        record: merged.clone(),
                    },
                );
                Ok(merged)
            }
        }
    }

    /// Buffer a delete. Deleting an absent key is a no-op.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<Option<Record>, Error> {
        let key = key.into();
        match self.buffered(&key) {
            Buffered::Insert {
                record,
                replaces: None,
            } => {
                // The insert never hit the bucket; forget it entirely.
                self.with_set(|set| {
                    set.writes.remove(&key);
                    set.order.retain(|k| k != &key);
                });
                Ok(Some(record))
            }
            Buffered::Insert {
                record,
                replaces: Some(expected),
            } => {
                self.stage(key, PendingWrite::Delete { expected });
                Ok(Some(record))
            }
            Buffered::Update { expected, record } => {
                self.stage(key, PendingWrite::Delete { expected });
                Ok(Some(record))
            }
            Buffered::Delete { .. } => Ok(None),
            Buffered::None => match self.handle.get(key.clone()).await? {
                None => Ok(None),
                Some(old) => {
                    self.stage(
                        key,
                        PendingWrite::Delete {
                            expected: old.version(),
                        },
                    );
                    Ok(Some(old))
                }
            },
        }
    }

    /// Delete every record visible to this transaction, buffered as
    /// individual deletes.
    pub async fn clear(&self) -> Result<usize, Error> {
        let records = self.all().await?;
        let key_field = self.handle.schema().key_field().to_string();
        let mut count = 0;
        for record in records {
            if let Some(key) = record.key(&key_field) {
                if self.delete(key).await?.is_some() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// The committed view with this transaction's buffer overlaid:
    /// deletes removed, inserts and updates in place of their committed
    /// counterparts.
    async fn overlay(&self) -> Result<Vec<Record>, Error> {
        let committed = self.handle.all().await?;
        let key_field = self.handle.schema().key_field().to_string();

        let mut merged: BTreeMap<Key, Record> = BTreeMap::new();
        for record in committed {
            if let Some(key) = record.key(&key_field) {
                merged.insert(key, record);
            }
        }

        let working = self.inner.working.lock();
        if let Some(set) = working.get(&self.name) {
            for (key, write) in &set.writes {
                match write {
                    PendingWrite::Delete { .. } => {
                        merged.remove(key);
                    }
                    PendingWrite::Insert { record, .. }
                    | PendingWrite::Update { record, .. } => {
                        merged.insert(key.clone(), record.clone());
                    }
                }
            }
        }

        Ok(merged.into_values().collect())
    }

    fn sorted(&self, mut records: Vec<Record>) -> Vec<Record> {
        let schema = self.handle.schema();
        crate::bucket::sort_canonical(&mut records, schema.def.order, schema.key_field());
        records
    }

    /// All records, overlay applied, canonical order.
    pub async fn all(&self) -> Result<Vec<Record>, Error> {
        Ok(self.sorted(self.overlay().await?))
    }

    /// Filtered records over the overlay.
    pub async fn find(&self, filter: Filter) -> Result<Vec<Record>, Error> {
        let records = self.overlay().await?;
        Ok(self.sorted(records.into_iter().filter(|r| filter.matches(r)).collect()))
    }

    /// First filtered record by canonical order.
    pub async fn find_one(&self, filter: Filter) -> Result<Option<Record>, Error> {
        Ok(self.find(filter).await?.into_iter().next())
    }

    /// Count over the overlay.
    pub async fn count(&self, filter: Filter) -> Result<usize, Error> {
        let records = self.overlay().await?;
        Ok(records.iter().filter(|r| filter.matches(r)).count())
    }

    /// First `n` records over the overlay.
    pub async fn first(&self, n: usize) -> Result<Vec<Record>, Error> {
        let mut all = self.all().await?;
        all.truncate(n);
        Ok(all)
    }

    /// Last `n` records over the overlay, ascending order.
    pub async fn last(&self, n: usize) -> Result<Vec<Record>, Error> {
        let all = self.all().await?;
        let skip = all.len().saturating_sub(n);
        Ok(all.into_iter().skip(skip).collect())
    }

    /// Page through the overlay.
    pub async fn paginate(&self, request: PageRequest, filter: Filter) -> Result<Page, Error> {
        let records = self.find(filter).await?;
        let schema = self.handle.schema();
        Ok(crate::bucket::paginate(
            records,
            &request,
            schema.def.order,
            schema.key_field(),
        ))
    }

    /// Sum over the overlay; 0 when nothing matches.
    pub async fn sum(&self, field: &str, filter: Filter) -> Result<f64, Error> {
        Ok(crate::bucket::sum(&self.find(filter).await?, field))
    }

    /// Average over the overlay; 0 when nothing matches.
    pub async fn avg(&self, field: &str, filter: Filter) -> Result<f64, Error> {
        Ok(crate::bucket::avg(&self.find(filter).await?, field))
    }

    /// Minimum over the overlay; `None` when nothing matches.
    pub async fn min(&self, field: &str, filter: Filter) -> Result<Option<f64>, Error> {
        Ok(crate::bucket::min(&self.find(filter).await?, field))
    }

    /// Maximum over the overlay; `None` when nothing matches.
    pub async fn max(&self, field: &str, filter: Filter) -> Result<Option<f64>, Error> {
        Ok(crate::bucket::max(&self.find(filter).await?, field))
    }
}
