//! The reactive query engine.
//!
//! Named queries execute against a recording context; subscriptions keep
//! the latest result and dependency set. Bucket events invalidate every
//! subscription whose set intersects the change, and a worker task
//! re-executes them serially. A re-execution only dispatches to the
//! subscriber when the new result differs structurally from the stored
//! one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::bucket::BucketHandle;
use crate::error::Error;
use crate::events::Event;
use crate::reactive::context::{DependencySet, QueryContext};
use crate::value::Value;

type QueryFn =
    Arc<dyn Fn(QueryContext, Value) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync>;
type Callback = Box<dyn Fn(&Value) + Send + Sync>;

struct SubState {
    result: Value,
    deps: DependencySet,
    /// Bumped on unsubscribe; a finished re-execution whose epoch is stale
    /// discards its result instead of dispatching.
    epoch: u64,
}

struct Subscription {
    name: String,
    params: Value,
    callback: Callback,
    active: AtomicBool,
    state: Mutex<SubState>,
}

enum EngineMsg {
    Event(Event),
    Shutdown,
}

struct EngineInner {
    buckets: Arc<DashMap<String, BucketHandle>>,
    queries: RwLock<HashMap<String, QueryFn>>,
    subs: RwLock<HashMap<u64, Arc<Subscription>>>,
    next_id: AtomicU64,
    queue: mpsc::UnboundedSender<EngineMsg>,
    /// Events accepted but not yet fully processed (including re-runs).
    pending: AtomicUsize,
    idle: Notify,
}

/// The dependency-tracking reactive engine.
#[derive(Clone)]
pub struct ReactiveEngine {
    inner: Arc<EngineInner>,
}

impl ReactiveEngine {
    /// Start the engine and its re-execution worker.
    pub(crate) fn start(buckets: Arc<DashMap<String, BucketHandle>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            buckets,
            queries: RwLock::new(HashMap::new()),
            subs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue: tx,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        tokio::spawn(worker(rx, Arc::clone(&inner)));
        Self { inner }
    }

    /// Register a named query. The name must be unused.
    pub fn define_query<F, Fut>(&self, name: &str, query: F) -> Result<(), Error>
    where
        F: Fn(QueryContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        let mut queries = self.inner.queries.write();
        if queries.contains_key(name) {
            return Err(Error::QueryAlreadyDefined {
                name: name.to_string(),
            });
        }
        let query: QueryFn = Arc::new(move |ctx, params| query(ctx, params).boxed());
        queries.insert(name.to_string(), query);
        Ok(())
    }

    /// Execute a query once, without recording dependencies or
    /// registering anything.
    pub async fn run_query(&self, name: &str, params: Value) -> Result<Value, Error> {
        let query = self.query_fn(name)?;
        let ctx = QueryContext::one_shot(Arc::clone(&self.inner.buckets));
        query(ctx, params).await
    }

    /// Subscribe to a query: run it once to capture the initial result and
    /// dependency set. The callback is NOT invoked with the initial
    /// result; it fires only when a later re-execution produces a
    /// structurally different one. Initial execution errors propagate and
    /// register nothing.
    pub async fn subscribe(
        &self,
        name: &str,
        params: Value,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<QuerySubscription, Error> {
        let query = self.query_fn(name)?;

        let recorder = Arc::new(Mutex::new(DependencySet::default()));
        let ctx =
            QueryContext::recording(Arc::clone(&self.inner.buckets), Arc::clone(&recorder));
        let result = query(ctx, params.clone()).await?;
        let deps = std::mem::take(&mut *recorder.lock());

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription {
            name: name.to_string(),
            params,
            callback: Box::new(callback),
            active: AtomicBool::new(true),
            state: Mutex::new(SubState {
                result,
                deps,
                epoch: 0,
            }),
        });
        self.inner.subs.write().insert(id, subscription);

        Ok(QuerySubscription {
            id,
            engine: Arc::downgrade(&self.inner),
        })
    }

    /// Feed a bucket event into invalidation. Wired to the bus's
    /// `bucket.*.*` subscription by the store.
    pub(crate) fn notify(&self, event: Event) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.inner.queue.send(EngineMsg::Event(event)).is_err()
            && self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1
        {
            self.inner.idle.notify_waiters();
        }
    }

    /// Events or re-executions still queued.
    pub(crate) fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until every queued invalidation and re-execution (and its
    /// callback) has finished.
    pub async fn settle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Live subscription count.
    pub fn subscription_count(&self) -> usize {
        self.inner.subs.read().len()
    }

    /// Drop every dependency on a bucket that is going away. Affected
    /// subscriptions stay alive; their next trigger re-records.
    pub(crate) fn prune_bucket(&self, name: &str) {
        for sub in self.inner.subs.read().values() {
            sub.state.lock().deps.prune_bucket(name);
        }
    }

    /// Destroy all subscriptions and stop the worker.
    pub(crate) fn shutdown(&self) {
        for (_, sub) in self.inner.subs.write().drain() {
            sub.active.store(false, Ordering::SeqCst);
        }
        let _ = self.inner.queue.send(EngineMsg::Shutdown);
    }

    fn query_fn(&self, name: &str) -> Result<QueryFn, Error> {
        self.inner
            .queries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::QueryNotDefined {
                name: name.to_string(),
            })
    }
}

async fn worker(mut rx: mpsc::UnboundedReceiver<EngineMsg>, inner: Arc<EngineInner>) {
    while let Some(msg) = rx.recv().await {
        let event = match msg {
            EngineMsg::Event(event) => event,
            EngineMsg::Shutdown => break,
        };

        let affected: Vec<Arc<Subscription>> = {
            let subs = inner.subs.read();
            subs.values()
                .filter(|sub| {
                    sub.active.load(Ordering::SeqCst) && sub.state.lock().deps.is_affected(&event)
                })
                .map(Arc::clone)
                .collect()
        };

        for sub in affected {
            rerun(&inner, sub).await;
        }

        if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.idle.notify_waiters();
        }
    }

    inner.pending.store(0, Ordering::SeqCst);
    inner.idle.notify_waiters();
}

/// Re-execute one subscription: fresh recording context, replace the
/// dependency set, deep-compare, dispatch only on change. Failures are
/// logged and swallowed; the prior result and dependencies stay.
async fn rerun(inner: &Arc<EngineInner>, sub: Arc<Subscription>) {
    let query = match inner.queries.read().get(&sub.name) {
        Some(q) => Arc::clone(q),
        None => return,
    };
    let epoch = sub.state.lock().epoch;

    let recorder = Arc::new(Mutex::new(DependencySet::default()));
    let ctx = QueryContext::recording(Arc::clone(&inner.buckets), Arc::clone(&recorder));

    match query(ctx, sub.params.clone()).await {
        Ok(new_result) => {
            let changed = {
                let mut state = sub.state.lock();
                if state.epoch != epoch || !sub.active.load(Ordering::SeqCst) {
                    // Unsubscribed while we were running.
                    return;
                }
                state.deps = std::mem::take(&mut *recorder.lock());
                if state.result == new_result {
                    false
                } else {
                    state.result = new_result.clone();
                    true
                }
            };
            if changed {
                (sub.callback)(&new_result);
            }
        }
        Err(e) => {
            warn!(query = %sub.name, error = %e, "reactive re-execution failed; keeping prior result");
        }
    }
}

/// Guard for a reactive subscription. Dropping the guard does not
/// unsubscribe; call [`QuerySubscription::unsubscribe`].
#[derive(Debug)]
pub struct QuerySubscription {
    id: u64,
    engine: Weak<EngineInner>,
}

impl QuerySubscription {
    /// Stop future invocations. A callback already in flight completes.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.engine.upgrade() {
            if let Some(sub) = inner.subs.write().remove(&self.id) {
                sub.active.store(false, Ordering::SeqCst);
                sub.state.lock().epoch += 1;
                debug!(query = %sub.name, "subscription removed");
            }
        }
    }
}
