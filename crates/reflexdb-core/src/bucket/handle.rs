//! The stateless bucket proxy.
//!
//! A `BucketHandle` is a cheap clone holding the mailbox sender; every
//! method is one asynchronous request/response round trip to the owning
//! server. A handle whose server is gone (dropped bucket, stopped store)
//! reports `BucketClosed`.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::bucket::ordering::{Page, PageRequest};
use crate::bucket::server::{
    AggregateOp, BucketStats, PendingWrite, Reply, Request, TxDecision,
};
use crate::bucket::snapshot::BucketSnapshot;
use crate::error::Error;
use crate::filter::Filter;
use crate::record::Record;
use crate::schema::Schema;
use crate::value::{Fields, Key};

/// Read/write proxy for one bucket.
#[derive(Clone)]
pub struct BucketHandle {
    schema: Arc<Schema>,
    tx: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for BucketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketHandle")
            .field("name", &self.schema.name)
            .finish()
    }
}

impl BucketHandle {
    pub(crate) fn new(schema: Arc<Schema>, tx: mpsc::UnboundedSender<Request>) -> Self {
        Self { schema, tx }
    }

    /// The bucket name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// The compiled schema backing this bucket.
    pub(crate) fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, Error> {
        let closed = || Error::BucketClosed {
            name: self.schema.name.clone(),
        };
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    /// Insert a record; returns it with metadata attached.
    pub async fn insert(&self, input: Fields) -> Result<Record, Error> {
        self.call(|reply| Request::Insert { input, reply }).await
    }

    /// Fetch a record by primary key.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Record>, Error> {
        let key = key.into();
        self.call(|reply| Request::Get { key, reply }).await
    }

    /// Merge changes into an existing record. Fails with `NotFound` for a
    /// missing key.
    pub async fn update(&self, key: impl Into<Key>, changes: Fields) -> Result<Record, Error> {
        let key = key.into();
        self.call(|reply| Request::Update { key, changes, reply })
            .await
    }

    /// Delete by primary key. A missing key is a no-op returning `None`.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<Option<Record>, Error> {
        let key = key.into();
        self.call(|reply| Request::Delete { key, reply }).await
    }

    /// Delete every record, emitting a `deleted` event per record.
    pub async fn clear(&self) -> Result<usize, Error> {
        self.call(|reply| Request::Clear { reply }).await
    }

    /// All records in canonical order.
    pub async fn all(&self) -> Result<Vec<Record>, Error> {
        self.call(|reply| Request::All { reply }).await
    }

    /// Records matching a filter, in canonical order.
    pub async fn find(&self, filter: Filter) -> Result<Vec<Record>, Error> {
        self.call(|reply| Request::Find { filter, reply }).await
    }

    /// First record matching a filter, by canonical order.
    pub async fn find_one(&self, filter: Filter) -> Result<Option<Record>, Error> {
        self.call(|reply| Request::FindOne { filter, reply }).await
    }

    /// Count of records matching a filter.
    pub async fn count(&self, filter: Filter) -> Result<usize, Error> {
        self.call(|reply| Request::Count { filter, reply }).await
    }

    /// The first `n` records in canonical order.
    pub async fn first(&self, n: usize) -> Result<Vec<Record>, Error> {
        self.call(|reply| Request::First { n, reply }).await
    }

    /// The last `n` records, still in ascending canonical order.
    pub async fn last(&self, n: usize) -> Result<Vec<Record>, Error> {
        self.call(|reply| Request::Last { n, reply }).await
    }

    /// Page through records matching a filter.
    pub async fn paginate(&self, request: PageRequest, filter: Filter) -> Result<Page, Error> {
        self.call(|reply| Request::Paginate {
            request,
            filter,
            reply,
        })
        .await
    }

    /// Sum of a numeric field over matching records; 0 when none match.
    pub async fn sum(&self, field: &str, filter: Filter) -> Result<f64, Error> {
        let result = self.aggregate(AggregateOp::Sum, field, filter).await?;
        Ok(result.unwrap_or(0.0))
    }

    /// Average of a numeric field over matching records; 0 when none match.
    pub async fn avg(&self, field: &str, filter: Filter) -> Result<f64, Error> {
        let result = self.aggregate(AggregateOp::Avg, field, filter).await?;
        Ok(result.unwrap_or(0.0))
    }

    /// Minimum of a numeric field; `None` when no numeric values match.
    pub async fn min(&self, field: &str, filter: Filter) -> Result<Option<f64>, Error> {
        self.aggregate(AggregateOp::Min, field, filter).await
    }

    /// Maximum of a numeric field; `None` when no numeric values match.
    pub async fn max(&self, field: &str, filter: Filter) -> Result<Option<f64>, Error> {
        self.aggregate(AggregateOp::Max, field, filter).await
    }

    async fn aggregate(
        &self,
        op: AggregateOp,
        field: &str,
        filter: Filter,
    ) -> Result<Option<f64>, Error> {
        let field = field.to_string();
        self.call(|reply| Request::Aggregate {
            op,
            field,
            filter,
            reply,
        })
        .await
    }

    /// Delete every record whose `_expiresAt` is at or before `now`.
    pub(crate) async fn purge_expired(&self, now: i64) -> Result<usize, Error> {
        self.call(|reply| Request::PurgeExpired { now, reply }).await
    }

    /// Validate an insert for a transaction buffer without applying it.
    pub(crate) async fn validate_insert(&self, input: Fields) -> Result<Record, Error> {
        self.call(|reply| Request::ValidateInsert { input, reply })
            .await
    }

    /// Validate an update against a base record without applying it.
    pub(crate) async fn validate_update(
        &self,
        base: Record,
        changes: Fields,
    ) -> Result<Record, Error> {
        self.call(|reply| Request::ValidateUpdate {
            base,
            changes,
            reply,
        })
        .await
    }

    /// Stage a transactional batch; the bucket stays locked until the
    /// decision channel resolves.
    pub(crate) async fn prepare(
        &self,
        writes: Vec<(Key, PendingWrite)>,
        reads: Vec<(Key, u64)>,
        decision: oneshot::Receiver<TxDecision>,
    ) -> Result<(), Error> {
        self.call(|reply| Request::Prepare {
            writes,
            reads,
            decision,
            reply,
        })
        .await
    }

    /// Produce a snapshot of the bucket.
    pub(crate) async fn snapshot(&self) -> Result<BucketSnapshot, Error> {
        self.call(|reply| Request::Snapshot { reply }).await
    }

    /// Install a snapshot. No events are emitted.
    pub(crate) async fn restore(&self, snapshot: BucketSnapshot) -> Result<usize, Error> {
        self.call(|reply| Request::Restore { snapshot, reply }).await
    }

    /// Live counters for `get_stats`.
    pub(crate) async fn stats(&self) -> Result<BucketStats, Error> {
        self.call(|reply| Request::Stats { reply }).await
    }

    /// Stop the server task. Outstanding queued requests ahead of the
    /// shutdown message still run.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown);
    }
}
