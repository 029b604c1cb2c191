//! Topic-based pub/sub with asynchronous dispatch.
//!
//! Publishers enqueue and return immediately; a dispatcher task delivers
//! events to matching subscribers in enqueue order. Each delivery runs in
//! its own spawned task that the dispatcher awaits, so one subscriber
//! panicking or stalling cannot poison the bus for the publisher or for
//! other subscribers' ordering guarantees within a topic.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::warn;

use super::topic::TopicPattern;
use super::Event;

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscriber {
    id: u64,
    pattern: TopicPattern,
    handler: Handler,
}

enum BusMsg {
    Publish(Event),
    Shutdown,
}

struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    tx: mpsc::UnboundedSender<BusMsg>,
    next_id: AtomicU64,
    /// Events accepted but not yet fully delivered.
    pending: AtomicUsize,
    idle: Notify,
}

/// The change-event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher task.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BusInner {
            subscribers: RwLock::new(Vec::new()),
            tx,
            next_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        tokio::spawn(dispatch_loop(rx, Arc::clone(&inner)));

        Self { inner }
    }

    /// Subscribe to a topic pattern (`*` matches one segment).
    ///
    /// The handler receives every matching event; its topic is available
    /// via [`Event::topic`].
    pub fn on<F, Fut>(&self, pattern: &str, handler: F) -> EventSubscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        self.inner.subscribers.write().push(Subscriber {
            id,
            pattern: TopicPattern::new(pattern),
            handler,
        });

        EventSubscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Enqueue an event for delivery. Never blocks the publisher.
    ///
    /// After shutdown the event is dropped.
    pub fn publish(&self, event: Event) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.inner.tx.send(BusMsg::Publish(event)).is_err()
            && self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1
        {
            self.inner.idle.notify_waiters();
        }
    }

    /// Number of events accepted but not yet fully delivered.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Wait until every published event has been delivered.
    pub async fn settle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop the dispatcher after the events already queued have been
    /// delivered. New subscribers and publications are ignored afterwards.
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(BusMsg::Shutdown);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<BusMsg>, inner: Arc<BusInner>) {
    while let Some(msg) = rx.recv().await {
        let event = match msg {
            BusMsg::Publish(event) => event,
            BusMsg::Shutdown => break,
        };
        let topic = event.topic();
        let matching: Vec<Handler> = {
            let subscribers = inner.subscribers.read();
            subscribers
                .iter()
                .filter(|s| s.pattern.matches(&topic))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in matching {
            // One spawned task per delivery so a panic is contained to the
            // subscriber and delivery order within the topic is kept.
            let delivery = tokio::spawn((handler)(event.clone()));
            if let Err(join_err) = delivery.await {
                warn!(topic = %topic, error = %join_err, "event subscriber failed");
            }
        }

        if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.idle.notify_waiters();
        }
    }

    inner.subscribers.write().clear();
    inner.pending.store(0, Ordering::SeqCst);
    inner.idle.notify_waiters();
}

/// Guard for an event subscription. Dropping the guard does not
/// unsubscribe; call [`EventSubscription::unsubscribe`].
pub struct EventSubscription {
    id: u64,
    bus: std::sync::Weak<BusInner>,
}

impl EventSubscription {
    /// Remove the subscriber. Deliveries already in flight complete.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.subscribers.write().retain(|s| s.id != self.id);
        }
    }
}
