//! Subscription bookkeeping.
//!
//! A subscription moves through three phases: requested (a `sub` frame is in
//! flight and the caller waits on a oneshot), ready (the server listed its id
//! in `ready`), active (a per-topic queue receives pushes). The registry is a
//! plain data structure owned by the dispatch task; callers never touch it.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use truenas_core::{ClientError, CorrelationId, Result};

use crate::message::{PushEvent, RemoteError};

/// Reply slot of a pending `subscribe` call.
pub(crate) type SubscribeReply = oneshot::Sender<Result<SubscriptionQueue>>;

/// Receiving end of one topic's pushes.
///
/// [`recv`](Self::recv) yields `None` once the topic is unsubscribed, the
/// server terminates it, or the connection closes.
#[derive(Debug)]
pub struct SubscriptionQueue {
    topic: String,
    rx: mpsc::UnboundedReceiver<PushEvent>,
}

impl SubscriptionQueue {
    /// A queue not attached to any connection, plus its feeding end.
    ///
    /// Useful for driving queue consumers without a server.
    #[must_use]
    pub fn channel(topic: impl Into<String>) -> (mpsc::UnboundedSender<PushEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                topic: topic.into(),
                rx,
            },
        )
    }

    /// Topic this queue belongs to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next push.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }

    /// Take a push if one is already queued.
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.rx.try_recv().ok()
    }
}

struct Pending {
    topic: String,
    reply: SubscribeReply,
}

struct Active {
    id: CorrelationId,
    tx: mpsc::UnboundedSender<PushEvent>,
}

/// Pending and active subscriptions of one connection.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    pending: HashMap<CorrelationId, Pending>,
    active: HashMap<String, Active>,
}

/// What [`SubscriptionRegistry::ready`] did with one id.
#[derive(Debug)]
pub(crate) enum ReadyOutcome {
    /// The caller received its queue.
    Delivered,
    /// The caller stopped waiting; the topic must be unsubscribed again.
    Orphaned(CorrelationId),
    /// Nothing was pending under this id.
    Unknown,
}

impl SubscriptionRegistry {
    /// Record a subscribe request.
    ///
    /// A topic that is already active or pending is rejected and the reply
    /// slot is handed back untouched.
    pub(crate) fn request(
        &mut self,
        id: CorrelationId,
        topic: String,
        reply: SubscribeReply,
    ) -> std::result::Result<(), (ClientError, SubscribeReply)> {
        if self.active.contains_key(&topic) {
            return Err((
                ClientError::ProtocolViolation(format!("topic {topic} is already subscribed")),
                reply,
            ));
        }
        if self.pending.values().any(|p| p.topic == topic) {
            return Err((
                ClientError::ProtocolViolation(format!("topic {topic} has a subscribe in flight")),
                reply,
            ));
        }
        let _ = self.pending.insert(id, Pending { topic, reply });
        Ok(())
    }

    /// Promote a pending request to active and hand its queue to the caller.
    pub(crate) fn ready(&mut self, id: &CorrelationId) -> ReadyOutcome {
        let Some(Pending { topic, reply }) = self.pending.remove(id) else {
            return ReadyOutcome::Unknown;
        };
        let (tx, queue) = SubscriptionQueue::channel(topic.clone());
        if reply.send(Ok(queue)).is_err() {
            debug!(%topic, "subscriber went away before ready");
            return ReadyOutcome::Orphaned(id.clone());
        }
        debug!(%topic, %id, "subscription active");
        let _ = self.active.insert(
            topic,
            Active {
                id: id.clone(),
                tx,
            },
        );
        ReadyOutcome::Delivered
    }

    /// Handle `nosub`: fail a pending request or end an active subscription.
    ///
    /// Returns the affected topic, if any.
    pub(crate) fn nosub(&mut self, id: &CorrelationId, error: Option<RemoteError>) -> Option<String> {
        if let Some(Pending { topic, reply }) = self.pending.remove(id) {
            let err = error.map_or_else(
                || ClientError::RemoteMethod {
                    method: format!("sub {topic}"),
                    message: "subscription refused".into(),
                    errno: None,
                },
                |e| e.into_client_error(&format!("sub {topic}")),
            );
            let _ = reply.send(Err(err));
            return Some(topic);
        }
        let topic = self
            .active
            .iter()
            .find(|(_, a)| &a.id == id)
            .map(|(t, _)| t.clone())?;
        let _ = self.active.remove(&topic);
        Some(topic)
    }

    /// Remove an active subscription, returning its original id.
    ///
    /// Dropping the sender ends the caller's queue after it drains.
    pub(crate) fn remove(&mut self, topic: &str) -> Option<CorrelationId> {
        self.active.remove(topic).map(|a| a.id)
    }

    /// Enqueue a push on its topic's queue.
    ///
    /// Pushes for inactive topics, or for queues whose receiver was dropped,
    /// are discarded. Returns whether the push was queued.
    pub(crate) fn deliver(&mut self, event: PushEvent) -> bool {
        let Some(active) = self.active.get(&event.collection) else {
            debug!(collection = %event.collection, "dropping push for inactive topic");
            return false;
        };
        if active.tx.send(event).is_err() {
            debug!("dropping push for closed queue");
            return false;
        }
        true
    }

    /// Whether `topic` is active.
    #[cfg(test)]
    pub(crate) fn is_active(&self, topic: &str) -> bool {
        self.active.contains_key(topic)
    }

    /// Release every pending caller with `ConnectionClosed` and end every queue.
    pub(crate) fn abandon_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(ClientError::ConnectionClosed));
        }
        self.active.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
