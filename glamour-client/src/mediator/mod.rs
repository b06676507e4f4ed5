//! Ordered publish/subscribe bus
//!
//! Producers call [`Mediator::publish`] from any thread. A single dispatch
//! task drains the queue and invokes matching handlers in publish order.
//! Messages published before [`Mediator::start`] are buffered and delivered
//! once the loop runs.
//!
//! Subscribers obtain a [`Subscriber`] handle from [`Mediator::register`].
//! Dropping the handle removes every registration it made, so a consumer's
//! subscriptions never outlive the consumer.
//!
//! Handlers run on the dispatch task and must return quickly. Long work is
//! handed off to the orchestrator or a spawned task.

mod messages;

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

pub use messages::{
    Event, HashFailure, Message, MessageKind, NotificationKind, Severity,
};

use crate::config::MediatorSettings;

/// Message handler; runs on the dispatch task
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Identity of a registered subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

enum Envelope {
    Message(Message),
    Flush(oneshot::Sender<()>),
    Stop,
}

struct Registration {
    token: u64,
    subscriber: SubscriberId,
    name: Arc<str>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<MessageKind, Vec<Registration>>,
}

impl Registry {
    fn contains(&self, kind: MessageKind, token: u64) -> bool {
        self.handlers
            .get(&kind)
            .is_some_and(|regs| regs.iter().any(|r| r.token == token))
    }
}

struct Inner {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    slow_handler_threshold: Duration,
}

/// Cloneable handle to the message bus
#[derive(Clone)]
pub struct Mediator {
    inner: Arc<Inner>,
}

impl Mediator {
    pub fn new(settings: &MediatorSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(Some(rx)),
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                slow_handler_threshold: settings.slow_handler_threshold(),
            }),
        }
    }

    /// Spawn the dispatch loop
    ///
    /// Returns `None` if the loop was already started.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let rx = self
            .inner
            .rx
            .lock()
            .expect("mediator receiver lock poisoned")
            .take()?;
        let weak = Arc::downgrade(&self.inner);
        debug!("mediator dispatch loop starting");
        Some(tokio::spawn(run_loop(weak, rx)))
    }

    /// Stop the dispatch loop after the messages already queued
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(Envelope::Stop);
    }

    /// Enqueue a message for delivery
    pub fn publish(&self, message: Message) {
        trace!(kind = message.kind().as_ref(), "publish");
        if self.inner.tx.send(Envelope::Message(message)).is_err() {
            debug!("mediator stopped, message dropped");
        }
    }

    /// Wait until every message published before this call has been
    /// dispatched
    ///
    /// Only resolves once the loop is running.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inner.tx.send(Envelope::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Create a subscriber identity tied to the returned handle's lifetime
    pub fn register(&self, name: impl Into<String>) -> Subscriber {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let name: Arc<str> = Arc::from(name.into());
        trace!(subscriber = %id, name = &*name, "registered");
        Subscriber {
            id,
            name,
            mediator: self.clone(),
        }
    }

    /// Register `handler` for messages of `kind` on behalf of `subscriber`
    pub fn subscribe<F>(&self, subscriber: &Subscriber, kind: MessageKind, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let token = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.inner.registry.lock().expect("mediator registry poisoned");
        registry.handlers.entry(kind).or_default().push(Registration {
            token,
            subscriber: subscriber.id,
            name: subscriber.name.clone(),
            handler: Arc::new(handler),
        });
        trace!(subscriber = %subscriber.id, kind = kind.as_ref(), "subscribed");
    }

    /// Remove `subscriber`'s handlers for one message kind
    pub fn unsubscribe(&self, subscriber: SubscriberId, kind: MessageKind) {
        let mut registry = self.inner.registry.lock().expect("mediator registry poisoned");
        if let Some(regs) = registry.handlers.get_mut(&kind) {
            regs.retain(|r| r.subscriber != subscriber);
        }
        trace!(subscriber = %subscriber, kind = kind.as_ref(), "unsubscribed");
    }

    /// Remove every registration made by `subscriber`
    ///
    /// Takes effect for the message currently being dispatched as well.
    pub fn unsubscribe_all(&self, subscriber: SubscriberId) {
        let mut registry = self.inner.registry.lock().expect("mediator registry poisoned");
        for regs in registry.handlers.values_mut() {
            regs.retain(|r| r.subscriber != subscriber);
        }
        registry.handlers.retain(|_, regs| !regs.is_empty());
        trace!(subscriber = %subscriber, "unsubscribed from all");
    }

    /// Number of handlers registered for `kind`
    pub fn handler_count(&self, kind: MessageKind) -> usize {
        let registry = self.inner.registry.lock().expect("mediator registry poisoned");
        registry.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl Inner {
    fn dispatch(&self, message: &Message) {
        let kind = message.kind();
        let targets: Vec<(u64, Arc<str>, Handler)> = {
            let registry = self.registry.lock().expect("mediator registry poisoned");
            match registry.handlers.get(&kind) {
                Some(regs) => regs
                    .iter()
                    .map(|r| (r.token, r.name.clone(), r.handler.clone()))
                    .collect(),
                None => return,
            }
        };

        for (token, name, handler) in targets {
            // An earlier handler may have unsubscribed this one
            let still_registered = self
                .registry
                .lock()
                .expect("mediator registry poisoned")
                .contains(kind, token);
            if !still_registered {
                continue;
            }

            let started = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| handler(message)));
            let elapsed = started.elapsed();

            if result.is_err() {
                error!(subscriber = &*name, kind = kind.as_ref(), "handler panicked");
            }
            if elapsed > self.slow_handler_threshold {
                warn!(
                    subscriber = &*name,
                    kind = kind.as_ref(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow mediator handler"
                );
            }
        }
    }
}

async fn run_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Message(message) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.dispatch(&message);
            }
            Envelope::Flush(ack) => {
                let _ = ack.send(());
            }
            Envelope::Stop => break,
        }
    }
    debug!("mediator dispatch loop stopped");
}

// =============================================================================
// Subscriber
// =============================================================================

/// Subscription handle; dropping it unsubscribes everything it registered
pub struct Subscriber {
    id: SubscriberId,
    name: Arc<str>,
    mediator: Mediator,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.mediator.subscribe(self, kind, handler);
    }

    pub fn unsubscribe(&self, kind: MessageKind) {
        self.mediator.unsubscribe(self.id, kind);
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.mediator.unsubscribe_all(self.id);
    }
}
