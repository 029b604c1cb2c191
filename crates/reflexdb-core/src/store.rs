//! The store façade: lifecycle, bucket registry, and routing.
//!
//! Startup wires the components in dependency order: event bus, bucket
//! registry (shared with the transaction coordinator), persistence, TTL
//! manager, and finally the reactive engine with its internal wildcard
//! subscription to `bucket.*.*`. Shutdown walks the same wiring in
//! reverse.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::bucket::{self, BucketHandle, BucketSnapshot, BucketStats};
use crate::config::StoreOptions;
use crate::error::Error;
use crate::events::{Event, EventBus, EventSubscription};
use crate::persist::PersistenceManager;
use crate::reactive::{QueryContext, QuerySubscription, ReactiveEngine};
use crate::schema::{BucketDef, Schema};
use crate::ttl::TtlManager;
use crate::txn::Tx;
use crate::value::Value;

/// Store-wide counters reported by [`Store::get_stats`].
#[derive(Debug)]
pub struct StoreStats {
    /// Per-bucket counters, keyed by bucket name.
    pub buckets: BTreeMap<String, BucketStats>,
    /// Live reactive subscriptions.
    pub subscriptions: usize,
    /// Buckets registered for TTL scanning.
    pub ttl_buckets: usize,
}

struct StoreInner {
    name: String,
    buckets: Arc<DashMap<String, BucketHandle>>,
    bus: EventBus,
    engine: ReactiveEngine,
    ttl: TtlManager,
    persistence: Option<PersistenceManager>,
    _engine_wiring: EventSubscription,
}

/// An in-memory, schema-enforced, reactive data store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Start a store: event bus, transaction plumbing, persistence, TTL
    /// manager, reactive engine, in that order.
    pub fn start(options: StoreOptions) -> Self {
        let bus = EventBus::new();
        let buckets: Arc<DashMap<String, BucketHandle>> = Arc::new(DashMap::new());

        let persistence = options
            .persistence
            .map(|adapter| PersistenceManager::start(adapter, options.snapshot_interval));
        let ttl = TtlManager::start(options.ttl_check_interval);

        let engine = ReactiveEngine::start(Arc::clone(&buckets));
        let feeder = engine.clone();
        let engine_wiring = bus.on("bucket.*.*", move |event| {
            feeder.notify(event);
            async {}
        });

        info!(store = %options.name, "store started");
        Self {
            inner: Arc::new(StoreInner {
                name: options.name,
                buckets,
                bus,
                engine,
                ttl,
                persistence,
                _engine_wiring: engine_wiring,
            }),
        }
    }

    /// The store name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register and start a bucket. Restores a persisted snapshot when the
    /// adapter holds one.
    pub async fn define_bucket(
        &self,
        name: &str,
        def: BucketDef,
    ) -> Result<BucketHandle, Error> {
        if self.inner.buckets.contains_key(name) {
            return Err(Error::BucketAlreadyExists {
                name: name.to_string(),
            });
        }

        let schema = Arc::new(Schema::compile(name, def)?);
        let persistent = schema.def.persistent;
        let has_ttl = schema.ttl.is_some();
        let handle = bucket::spawn(Arc::clone(&schema), self.inner.bus.clone());

        if let Some(persistence) = &self.inner.persistence {
            if persistent {
                let restored = async {
                    match persistence.load(name)? {
                        Some(blob) => {
                            let snapshot = BucketSnapshot::from_blob(&blob)?;
                            handle.restore(snapshot).await
                        }
                        None => Ok(0),
                    }
                }
                .await;
                match restored {
                    Ok(0) => {}
                    Ok(count) => debug!(bucket = name, count, "bucket restored from snapshot"),
                    Err(e) => {
                        handle.shutdown();
                        return Err(e);
                    }
                }
            }
        }

        match self.inner.buckets.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                handle.shutdown();
                Err(Error::BucketAlreadyExists {
                    name: name.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                if has_ttl {
                    self.inner.ttl.register(handle.clone());
                }
                if persistent {
                    if let Some(persistence) = &self.inner.persistence {
                        persistence.register(handle.clone());
                    }
                }
                debug!(bucket = name, "bucket defined");
                Ok(handle)
            }
        }
    }

    /// A stateless proxy to a bucket.
    pub fn bucket(&self, name: &str) -> Result<BucketHandle, Error> {
        self.inner
            .buckets
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::BucketNotDefined {
                name: name.to_string(),
            })
    }

    /// Names of all defined buckets.
    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.inner.buckets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Terminate a bucket and forget it everywhere: TTL scanning,
    /// persistence (including its stored blob), and reactive dependency
    /// sets. Records are destroyed without per-record events.
    pub fn drop_bucket(&self, name: &str) -> Result<(), Error> {
        let (_, handle) =
            self.inner
                .buckets
                .remove(name)
                .ok_or_else(|| Error::BucketNotDefined {
                    name: name.to_string(),
                })?;

        self.inner.ttl.unregister(name);
        if let Some(persistence) = &self.inner.persistence {
            persistence.unregister(name);
        }
        self.inner.engine.prune_bucket(name);
        handle.shutdown();
        debug!(bucket = name, "bucket dropped");
        Ok(())
    }

    /// Run `body` atomically across buckets. The body receives a
    /// transactional context whose writes buffer until commit; an error
    /// from the body aborts with no bucket touched.
    pub async fn transaction<F, Fut, T>(&self, body: F) -> Result<T, Error>
    where
        F: FnOnce(Tx) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let tx = Tx::new(Arc::clone(&self.inner.buckets));
        let result = body(tx.clone()).await?;
        tx.commit(&self.inner.bus).await?;
        Ok(result)
    }

    /// Subscribe to change events by topic pattern (`*` matches one
    /// segment).
    pub fn on<F, Fut>(&self, pattern: &str, handler: F) -> EventSubscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.bus.on(pattern, handler)
    }

    /// Register a named reactive query.
    pub fn define_query<F, Fut>(&self, name: &str, query: F) -> Result<(), Error>
    where
        F: Fn(QueryContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.inner.engine.define_query(name, query)
    }

    /// Subscribe to a reactive query. The callback fires only when a
    /// re-execution produces a structurally different result; it is never
    /// invoked with the initial one.
    pub async fn subscribe(
        &self,
        name: &str,
        params: Value,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<QuerySubscription, Error> {
        self.inner.engine.subscribe(name, params, callback).await
    }

    /// Execute a query once, with dependency tracking disabled.
    pub async fn run_query(&self, name: &str, params: Value) -> Result<Value, Error> {
        self.inner.engine.run_query(name, params).await
    }

    /// Force a TTL scan over every TTL bucket; returns the purged count.
    pub async fn purge_ttl(&self) -> usize {
        self.inner.ttl.purge_now().await
    }

    /// Wait until every queued event delivery and reactive re-execution
    /// (callbacks included) has finished. Callbacks that mutate the store
    /// schedule more work; the drain loops until both stages are idle.
    pub async fn settle(&self) {
        loop {
            self.inner.bus.settle().await;
            self.inner.engine.settle().await;
            if self.inner.bus.pending() == 0 && self.inner.engine.pending() == 0 {
                return;
            }
        }
    }

    /// Report record, index, subscription, and TTL counters.
    pub async fn get_stats(&self) -> Result<StoreStats, Error> {
        let handles: Vec<BucketHandle> = self
            .inner
            .buckets
            .iter()
            .map(|e| e.value().clone())
            .collect();

        let mut buckets = BTreeMap::new();
        for handle in handles {
            let stats = handle.stats().await?;
            buckets.insert(handle.name().to_string(), stats);
        }

        Ok(StoreStats {
            buckets,
            subscriptions: self.inner.engine.subscription_count(),
            ttl_buckets: self.inner.ttl.bucket_count(),
        })
    }

    /// Graceful shutdown: stop TTL timers, destroy reactive
    /// subscriptions, flush persistence (servers still live), terminate
    /// the bucket servers, and shut down the bus.
    pub async fn stop(&self) {
        self.inner.ttl.stop();
        self.inner.engine.shutdown();

        if let Some(persistence) = &self.inner.persistence {
            persistence.flush().await;
            persistence.stop();
        }

        for entry in self.inner.buckets.iter() {
            entry.value().shutdown();
        }
        self.inner.buckets.clear();

        self.inner.bus.settle().await;
        self.inner.bus.shutdown();
        info!(store = %self.inner.name, "store stopped");
    }
}
