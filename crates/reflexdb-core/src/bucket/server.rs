//! The per-bucket actor.
//!
//! A `BucketServer` owns one bucket outright: the record map, the index
//! manager, the autoincrement counter, and the compiled schema. All
//! operations arrive through a FIFO mailbox and never interleave, which is
//! what makes the uniqueness, version, and event-ordering guarantees hold
//! without further locking.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::bucket::evict::pick_victim;
use crate::bucket::handle::BucketHandle;
use crate::bucket::ordering::{self, Page, PageRequest};
use crate::bucket::snapshot::BucketSnapshot;
use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::filter::Filter;
use crate::index::IndexManager;
use crate::record::{now_ms, Record};
use crate::schema::{prepare_insert, prepare_update, InsertContext, Schema};
use crate::value::{Fields, Key};

use std::sync::Arc;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// A buffered transactional write, collapsed to one entry per key.
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    /// Insert a fresh record. `replaces` carries the expected version of a
    /// live record the same transaction deleted first.
    Insert {
        record: Record,
        replaces: Option<u64>,
    },
    /// Replace the record, provided its live version still matches.
    Update { expected: u64, record: Record },
    /// Delete the record, provided its live version still matches.
    Delete { expected: u64 },
}

/// The commit decision delivered to a prepared bucket.
pub(crate) enum TxDecision {
    /// Apply the staged writes; the events they produce are sent back for
    /// the coordinator to publish after every bucket has committed.
    Commit {
        events: oneshot::Sender<Vec<Event>>,
    },
    /// Discard the staged writes.
    Abort,
}

/// Aggregate selector for the combined aggregate request.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
}

/// Mailbox messages. Every variant carries its own reply channel.
pub(crate) enum Request {
    Insert {
        input: Fields,
        reply: Reply<Record>,
    },
    Get {
        key: Key,
        reply: Reply<Option<Record>>,
    },
    Update {
        key: Key,
        changes: Fields,
        reply: Reply<Record>,
    },
    Delete {
        key: Key,
        reply: Reply<Option<Record>>,
    },
    Clear {
        reply: Reply<usize>,
    },
    All {
        reply: Reply<Vec<Record>>,
    },
    Find {
        filter: Filter,
        reply: Reply<Vec<Record>>,
    },
    FindOne {
        filter: Filter,
        reply: Reply<Option<Record>>,
    },
    Count {
        filter: Filter,
        reply: Reply<usize>,
    },
    First {
        n: usize,
        reply: Reply<Vec<Record>>,
    },
    Last {
        n: usize,
        reply: Reply<Vec<Record>>,
    },
    Paginate {
        request: PageRequest,
        filter: Filter,
        reply: Reply<Page>,
    },
    Aggregate {
        op: AggregateOp,
        field: String,
        filter: Filter,
        reply: Reply<Option<f64>>,
    },
    PurgeExpired {
        now: i64,
        reply: Reply<usize>,
    },
    /// Validate and prepare an insert without applying it. Draws generated
    /// values (including the autoincrement sequence) for the transaction
    /// buffer.
    ValidateInsert {
        input: Fields,
        reply: Reply<Record>,
    },
    /// Validate and merge an update against a caller-supplied base record
    /// without applying it.
    ValidateUpdate {
        base: Record,
        changes: Fields,
        reply: Reply<Record>,
    },
    /// Stage a transactional batch. On success the mailbox parks until the
    /// coordinator's decision arrives, which is what locks the bucket
    /// between prepare and commit.
    Prepare {
        writes: Vec<(Key, PendingWrite)>,
        reads: Vec<(Key, u64)>,
        decision: oneshot::Receiver<TxDecision>,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<BucketSnapshot>,
    },
    Restore {
        snapshot: BucketSnapshot,
        reply: Reply<usize>,
    },
    Stats {
        reply: Reply<BucketStats>,
    },
    Shutdown,
}

/// Counters reported by `get_stats`.
#[derive(Debug, Clone)]
pub struct BucketStats {
    /// Live records.
    pub records: usize,
    /// Indexed fields (secondary plus unique).
    pub indexes: usize,
    /// Whether the bucket has a TTL.
    pub ttl: bool,
    /// The size cap, if any.
    pub max_size: Option<usize>,
}

/// Spawn the actor task for a bucket and return its handle.
pub(crate) fn spawn(schema: Arc<Schema>, bus: EventBus) -> BucketHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = BucketServer {
        schema: Arc::clone(&schema),
        records: BTreeMap::new(),
        indexes: IndexManager::new(
            schema.name.clone(),
            schema.indexed_fields.iter().cloned(),
            schema.def.unique.iter().cloned(),
        ),
        autoincrement: 0,
        bus,
    };
    tokio::spawn(run(server, rx));
    BucketHandle::new(schema, tx)
}

async fn run(mut server: BucketServer, mut rx: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = rx.recv().await {
        match request {
            Request::Prepare {
                writes,
                reads,
                decision,
                reply,
            } => server.handle_prepare(writes, reads, decision, reply).await,
            Request::Shutdown => break,
            other => server.handle(other),
        }
    }
    debug!(bucket = %server.schema.name, "bucket server stopped");
}

struct BucketServer {
    schema: Arc<Schema>,
    records: BTreeMap<Key, Record>,
    indexes: IndexManager,
    autoincrement: i64,
    bus: EventBus,
}

impl BucketServer {
    fn handle(&mut self, request: Request) {
        match request {
            Request::Insert { input, reply } => {
                let result = self.insert(input);
                let _ = reply.send(result);
            }
            Request::Get { key, reply } => {
                let _ = reply.send(Ok(self.records.get(&key).cloned()));
            }
            Request::Update { key, changes, reply } => {
                let result = self.update(key, changes);
                let _ = reply.send(result);
            }
            Request::Delete { key, reply } => {
                let _ = reply.send(Ok(self.delete(&key)));
            }
            Request::Clear { reply } => {
                let _ = reply.send(Ok(self.clear()));
            }
            Request::All { reply } => {
                let _ = reply.send(Ok(self.sorted(self.records.values().cloned().collect())));
            }
            Request::Find { filter, reply } => {
                let _ = reply.send(Ok(self.sorted(self.filtered(&filter))));
            }
            Request::FindOne { filter, reply } => {
                let found = self.sorted(self.filtered(&filter)).into_iter().next();
                let _ = reply.send(Ok(found));
            }
            Request::Count { filter, reply } => {
                let _ = reply.send(Ok(self.filtered(&filter).len()));
            }
            Request::First { n, reply } => {
                let mut all = self.sorted(self.records.values().cloned().collect());
                all.truncate(n);
                let _ = reply.send(Ok(all));
            }
            Request::Last { n, reply } => {
                let all = self.sorted(self.records.values().cloned().collect());
                let skip = all.len().saturating_sub(n);
                let _ = reply.send(Ok(all.into_iter().skip(skip).collect()));
            }
            Request::Paginate {
                request,
                filter,
                reply,
            } => {
                let sorted = self.sorted(self.filtered(&filter));
                let page = ordering::paginate(
                    sorted,
                    &request,
                    self.schema.def.order,
                    self.schema.key_field(),
                );
                let _ = reply.send(Ok(page));
            }
            Request::Aggregate {
                op,
                field,
                filter,
                reply,
            } => {
                let records = self.filtered(&filter);
                let result = match op {
                    AggregateOp::Sum => Some(ordering::sum(&records, &field)),
                    AggregateOp::Avg => Some(ordering::avg(&records, &field)),
                    AggregateOp::Min => ordering::min(&records, &field),
                    AggregateOp::Max => ordering::max(&records, &field),
                };
                let _ = reply.send(Ok(result));
            }
            Request::PurgeExpired { now, reply } => {
                let _ = reply.send(Ok(self.purge_expired(now)));
            }
            Request::ValidateInsert { input, reply } => {
                let result = self.prepare_record(input);
                let _ = reply.send(result);
            }
            Request::ValidateUpdate {
                base,
                changes,
                reply,
            } => {
                let result = prepare_update(&self.schema, &base, changes, now_ms());
                let _ = reply.send(result);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Request::Restore { snapshot, reply } => {
                let result = self.restore(snapshot);
                let _ = reply.send(result);
            }
            Request::Stats { reply } => {
                let _ = reply.send(Ok(BucketStats {
                    records: self.records.len(),
                    indexes: self.indexes.index_count(),
                    ttl: self.schema.ttl.is_some(),
                    max_size: self.schema.def.max_size,
                }));
            }
            Request::Prepare { .. } | Request::Shutdown => unreachable!("handled by run loop"),
        }
    }

    /// Run the validator with this bucket's clock, TTL, and sequence.
    fn prepare_record(&mut self, input: Fields) -> Result<Record, Error> {
        let ttl_ms = self.schema.ttl_millis();
        let counter = &mut self.autoincrement;
        let mut next_seq = || {
            *counter += 1;
            *counter
        };
        let mut ctx = InsertContext {
            now_ms: now_ms(),
            ttl_ms,
            next_seq: &mut next_seq,
        };
        prepare_insert(&self.schema, input, &mut ctx)
    }

    fn insert(&mut self, input: Fields) -> Result<Record, Error> {
        let record = self.prepare_record(input)?;
        let key = self.key_of(&record)?;

        let mut events = self.apply_insert(key, record.clone(), None)?;
        for event in events.drain(..) {
            self.bus.publish(event);
        }
        Ok(record)
    }

    fn update(&mut self, key: Key, changes: Fields) -> Result<Record, Error> {
        let old = self
            .records
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                bucket: self.schema.name.clone(),
                key: key.clone(),
            })?;
        let merged = prepare_update(&self.schema, &old, changes, now_ms())?;

        self.indexes.update(&key, &old, &merged)?;
        self.records.insert(key.clone(), merged.clone());
        self.bus.publish(Event::updated(
            self.schema.name.clone(),
            key,
            old,
            merged.clone(),
        ));
        Ok(merged)
    }

    fn delete(&mut self, key: &Key) -> Option<Record> {
        let old = self.records.remove(key)?;
        self.indexes.remove(key, &old);
        self.bus.publish(Event::deleted(
            self.schema.name.clone(),
            key.clone(),
            old.clone(),
        ));
        Some(old)
    }

    fn clear(&mut self) -> usize {
        let drained: Vec<(Key, Record)> = std::mem::take(&mut self.records).into_iter().collect();
        self.indexes.clear();
        let count = drained.len();
        for (key, record) in drained {
            self.bus
                .publish(Event::deleted(self.schema.name.clone(), key, record));
        }
        count
    }

    fn purge_expired(&mut self, now: i64) -> usize {
        let expired: Vec<Key> = self
            .records
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.delete(key);
        }
        expired.len()
    }

    /// Install a record, then evict past the size cap. Returns the events
    /// in the order they must publish. Used by both direct inserts and
    /// commit application.
    fn apply_insert(
        &mut self,
        key: Key,
        record: Record,
        replaces: Option<u64>,
    ) -> Result<Vec<Event>, Error> {
        let mut events = Vec::new();

        if let Some(_expected) = replaces {
            // The transaction deleted the live record before re-inserting;
            // versions were verified at prepare.
            if let Some(old) = self.records.remove(&key) {
                self.indexes.remove(&key, &old);
                events.push(Event::deleted(self.schema.name.clone(), key.clone(), old));
            }
        } else if self.records.contains_key(&key) {
            return Err(Error::UniqueConstraint {
                bucket: self.schema.name.clone(),
                field: self.schema.key_field().to_string(),
                value: key.clone().into(),
            });
        }

        self.indexes.add(&key, &record)?;
        self.records.insert(key.clone(), record.clone());
        events.push(Event::inserted(self.schema.name.clone(), key, record));

        if let Some(max_size) = self.schema.def.max_size {
            while self.records.len() > max_size {
                let Some(victim) = pick_victim(&self.records) else {
                    break;
                };
                let Some(old) = self.records.remove(&victim) else {
                    break;
                };
                self.indexes.remove(&victim, &old);
                events.push(Event::deleted(self.schema.name.clone(), victim, old));
            }
        }

        Ok(events)
    }

    fn key_of(&self, record: &Record) -> Result<Key, Error> {
        record
            .key(self.schema.key_field())
            .ok_or_else(|| Error::InvalidDefinition {
                bucket: self.schema.name.clone(),
                reason: format!("record has no usable key in '{}'", self.schema.key_field()),
            })
    }

    fn filtered(&self, filter: &Filter) -> Vec<Record> {
        match self.indexes.candidates(filter) {
            Some(candidates) => candidates
                .into_iter()
                .filter_map(|k| self.records.get(&k))
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
            None => self
                .records
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
        }
    }

    fn sorted(&self, mut records: Vec<Record>) -> Vec<Record> {
        ordering::sort_canonical(&mut records, self.schema.def.order, self.schema.key_field());
        records
    }

    fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            bucket: self.schema.name.clone(),
            key_field: self.schema.key_field().to_string(),
            autoincrement: self.autoincrement,
            records: self.sorted(self.records.values().cloned().collect()),
        }
    }

    /// Install a snapshot: records verbatim, indexes rebuilt, counter
    /// restored. Emits no events.
    fn restore(&mut self, snapshot: BucketSnapshot) -> Result<usize, Error> {
        if snapshot.key_field != self.schema.key_field() {
            return Err(Error::Persistence(format!(
                "snapshot for '{}' was keyed by '{}', bucket expects '{}'",
                snapshot.bucket,
                snapshot.key_field,
                self.schema.key_field()
            )));
        }

        let mut records = BTreeMap::new();
        for record in snapshot.records {
            let key = self.key_of(&record)?;
            records.insert(key, record);
        }

        self.indexes.rebuild(records.iter())?;
        let count = records.len();
        self.records = records;
        self.autoincrement = snapshot.autoincrement;
        Ok(count)
    }

    async fn handle_prepare(
        &mut self,
        writes: Vec<(Key, PendingWrite)>,
        reads: Vec<(Key, u64)>,
        decision: oneshot::Receiver<TxDecision>,
        reply: Reply<()>,
    ) {
        if let Err(e) = self.check_prepare(&writes, &reads) {
            let _ = reply.send(Err(e));
            return;
        }
        let _ = reply.send(Ok(()));

        // Parked here, the mailbox admits nothing else: the staged state
        // cannot be invalidated between prepare and the decision.
        match decision.await {
            Ok(TxDecision::Commit { events }) => {
                let produced = self.apply_batch(writes);
                let _ = events.send(produced);
            }
            Ok(TxDecision::Abort) | Err(_) => {
                debug!(bucket = %self.schema.name, "transaction aborted after prepare");
            }
        }
    }

    /// Verify a staged batch without mutating anything: read versions,
    /// write expected versions, primary-key collisions, and uniqueness
    /// over the batch overlay.
    fn check_prepare(
        &self,
        writes: &[(Key, PendingWrite)],
        reads: &[(Key, u64)],
    ) -> Result<(), Error> {
        let conflict = |key: &Key, expected: u64, actual: u64| Error::TransactionConflict {
            bucket: self.schema.name.clone(),
            key: key.clone(),
            expected,
            actual,
        };

        for (key, expected) in reads {
            let actual = self.records.get(key).map(|r| r.version()).unwrap_or(0);
            if actual != *expected {
                return Err(conflict(key, *expected, actual));
            }
        }

        // Uniqueness is simulated on a scratch copy of the indexes; the
        // batch has one write per key, so live versions are authoritative.
        let mut scratch = self.indexes.clone();
        for (key, write) in writes {
            let live_version = self.records.get(key).map(|r| r.version()).unwrap_or(0);
            match write {
                PendingWrite::Insert { record, replaces } => {
                    match replaces {
                        Some(expected) => {
                            if live_version != *expected {
                                return Err(conflict(key, *expected, live_version));
                            }
                            if let Some(old) = self.records.get(key) {
                                scratch.remove(key, old);
                            }
                        }
                        None => {
                            if live_version != 0 {
                                return Err(Error::UniqueConstraint {
                                    bucket: self.schema.name.clone(),
                                    field: self.schema.key_field().to_string(),
                                    value: key.clone().into(),
                                });
                            }
                        }
                    }
                    scratch.add(key, record)?;
                }
                PendingWrite::Update { expected, record } => {
                    let old = self
                        .records
                        .get(key)
                        .ok_or_else(|| conflict(key, *expected, 0))?;
                    if old.version() != *expected {
                        return Err(conflict(key, *expected, old.version()));
                    }
                    scratch.update(key, old, record)?;
                }
                PendingWrite::Delete { expected } => {
                    let old = self
                        .records
                        .get(key)
                        .ok_or_else(|| conflict(key, *expected, 0))?;
                    if old.version() != *expected {
                        return Err(conflict(key, *expected, old.version()));
                    }
                    scratch.remove(key, old);
                }
            }
        }
        Ok(())
    }

    /// Apply a verified batch. Eviction triggered by a transactional
    /// insert joins the batch's events.
    fn apply_batch(&mut self, writes: Vec<(Key, PendingWrite)>) -> Vec<Event> {
        let mut events = Vec::new();
        for (key, write) in writes {
            let applied: Result<(), Error> = match write {
                PendingWrite::Insert { record, replaces } => self
                    .apply_insert(key.clone(), record, replaces)
                    .map(|mut produced| events.append(&mut produced)),
                PendingWrite::Update { expected: _, record } => {
                    match self.records.get(&key).cloned() {
                        Some(old) => self.indexes.update(&key, &old, &record).map(|()| {
                            self.records.insert(key.clone(), record.clone());
                            events.push(Event::updated(
                                self.schema.name.clone(),
                                key.clone(),
                                old,
                                record,
                            ));
                        }),
                        None => Ok(()),
                    }
                }
                PendingWrite::Delete { expected: _ } => {
                    if let Some(old) = self.records.remove(&key) {
                        self.indexes.remove(&key, &old);
                        events.push(Event::deleted(
                            self.schema.name.clone(),
                            key.clone(),
                            old,
                        ));
                    }
                    Ok(())
                }
            };
            if let Err(e) = applied {
                // check_prepare verified the batch and the mailbox was
                // parked in between, so this indicates a bug.
                error!(bucket = %self.schema.name, key = %key, error = %e, "staged write failed to apply");
            }
        }
        events
    }
}
