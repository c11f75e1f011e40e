//! Topic-keyed publish/subscribe hub for relay frames.
//!
//! [`Broker`] decouples the task reading a client from the task writing to
//! the upstream. Each session subscribes under its own [`SessionId`] topic
//! and receives a bounded [`tokio::sync::mpsc`] queue; publishing to a topic
//! enqueues a copy of the frame on every subscription registered under it.
//!
//! # Concurrency
//!
//! - The registry is a single `Mutex<HashMap<..>>` shared by all sessions.
//!   The lock is never held across an `.await`: `publish` snapshots the
//!   target senders and releases it before enqueuing.
//! - Enqueues to different subscriptions run concurrently, so a full queue
//!   delays only the publisher, never another subscriber.
//! - A full queue blocks the publisher until the consumer catches up.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use futures_util::future::join_all;
use tokio::sync::mpsc;

use super::{Frame, SessionId};

/// Identifies one registration in the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    topic: SessionId,
    seq: u64,
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.seq)
    }
}

type Registry = HashMap<SessionId, HashMap<u64, mpsc::Sender<Frame>>>;

#[derive(Debug)]
struct BrokerInner {
    registry: Mutex<Registry>,
    capacity: usize,
    next_seq: AtomicU64,
}

/// In-process publish/subscribe hub.
///
/// Cheap to clone; all clones share one registry.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Creates a broker whose subscription queues hold up to `capacity`
    /// frames each. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                registry: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Per-subscription queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Registers a new subscription on `topic`.
    ///
    /// The returned handle yields frames published to `topic` from this
    /// point on, in publish order. It unregisters itself when dropped.
    #[must_use]
    pub fn subscribe(&self, topic: SessionId) -> Subscription {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        self.registry()
            .entry(topic)
            .or_default()
            .insert(seq, sender);

        let id = SubscriptionId { topic, seq };
        tracing::trace!(subscription = %id, "subscribed");
        Subscription {
            id,
            receiver,
            broker: self.clone(),
        }
    }

    /// Removes a subscription from the registry.
    ///
    /// Idempotent: returns `false` if it was already removed. Frames already
    /// queued stay readable on the [`Subscription`] handle, which reports
    /// end-of-stream once they are drained.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let Some(subscribers) = registry.get_mut(&id.topic) else {
            return false;
        };
        let removed = subscribers.remove(&id.seq).is_some();
        if subscribers.is_empty() {
            registry.remove(&id.topic);
        }
        drop(registry);

        if removed {
            tracing::trace!(subscription = %id, "unsubscribed");
        }
        removed
    }

    /// Publishes `frame` to every subscription registered on `topic`.
    ///
    /// Returns the number of subscriptions that accepted the frame.
    /// Publishing to a topic with no subscribers is a no-op returning 0, and
    /// a subscription removed while the publish is in flight is skipped.
    pub async fn publish(&self, topic: SessionId, frame: Frame) -> usize {
        let senders: Vec<mpsc::Sender<Frame>> = match self.registry().get(&topic) {
            Some(subscribers) => subscribers.values().cloned().collect(),
            None => return 0,
        };

        match senders.as_slice() {
            [] => 0,
            [sender] => usize::from(sender.send(frame).await.is_ok()),
            _ => {
                let deliveries = senders.iter().map(|sender| sender.send(frame.clone()));
                join_all(deliveries)
                    .await
                    .into_iter()
                    .filter(Result::is_ok)
                    .count()
            }
        }
    }

    /// Returns `true` if the subscription is still registered.
    #[must_use]
    pub fn is_registered(&self, id: SubscriptionId) -> bool {
        self.registry()
            .get(&id.topic)
            .is_some_and(|subscribers| subscribers.contains_key(&id.seq))
    }

    /// Returns the total number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.registry().values().map(HashMap::len).sum()
    }

    /// Returns the number of topics with at least one subscription.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock is still safe to use.
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of one broker registration.
///
/// Yields frames lazily and in order through [`Subscription::recv`] or the
/// [`Stream`] implementation. Pulling suspends until a frame is available.
/// Dropping the handle unregisters it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<Frame>,
    broker: Broker,
}

impl Subscription {
    /// Returns this subscription's identifier.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next frame.
    ///
    /// Returns `None` once the subscription has been unsubscribed and every
    /// frame queued before that has been returned.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Unregisters the subscription and closes its queue.
    ///
    /// No frame can be delivered after this returns, not even by a publish
    /// that was already in flight. Frames queued earlier remain readable.
    pub fn close(&mut self) {
        self.broker.unsubscribe(self.id);
        self.receiver.close();
    }

    /// Drops every frame currently queued and returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.id);
    }
}
