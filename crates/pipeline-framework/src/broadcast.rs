//! # Live Fan-out
//!
//! [`Broadcaster`] delivers every published event to every current subscriber.
//!
//! - Each subscriber owns a bounded queue. When it is full, that subscriber loses the
//!   event and everyone else still gets it; the publisher never waits.
//! - Subscribers only see events published after they subscribed. There is no replay.
//! - The subscriber set is snapshotted before sending, so subscribing or unsubscribing
//!   during a publish is safe.
//! - Dropping a [`Subscription`] unsubscribes it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

/// What happened to one published event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers whose queue was full.
    pub dropped: usize,
    /// Subscribers found closed and removed.
    pub removed: usize,
}

struct Registry<E> {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<E>>>,
    next_id: AtomicU64,
}

impl<E> Registry<E> {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<E>>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: SubscriberId) -> bool {
        self.lock().remove(&id).is_some()
    }
}

/// Cloneable handle to one subscriber set.
pub struct Broadcaster<E> {
    registry: Arc<Registry<E>>,
    capacity: usize,
}

impl<E> Clone for Broadcaster<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            capacity: self.capacity,
        }
    }
}

impl<E: Clone + Send + 'static> Broadcaster<E> {
    /// `capacity` is the per-subscriber queue length.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subscribers = self.registry.lock();
            subscribers.insert(id, sender);
            subscribers.len()
        };
        info!(subscriber = id, subscribers = count, "Subscribed");
        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.registry.remove(id);
        if removed {
            info!(subscriber = id, "Unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn publish(&self, event: E) -> PublishReport {
        let targets: Vec<(SubscriberId, mpsc::Sender<E>)> = self
            .registry
            .lock()
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();

        let mut report = PublishReport::default();
        for (id, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, "Subscriber lagging, event dropped");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    if self.registry.remove(id) {
                        debug!(subscriber = id, "Removed closed subscriber");
                        report.removed += 1;
                    }
                }
            }
        }
        report
    }
}

/// One subscriber's end of a [`Broadcaster`].
pub struct Subscription<E> {
    id: SubscriberId,
    receiver: mpsc::Receiver<E>,
    registry: Weak<Registry<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                debug!(subscriber = self.id, "Subscription dropped");
            }
        }
    }
}

/// Where a forwarded subscription writes its frames, such as an open HTTP response.
#[async_trait]
pub trait EventSink: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

#[derive(Debug)]
pub enum ForwardOutcome {
    Cancelled,
    /// The broadcaster was dropped.
    Closed,
    /// The sink failed; the observer is gone.
    Disconnected(std::io::Error),
}

/// Writes every event of `subscription` to `sink` until cancelled, closed or disconnected.
///
/// Events that `encode` rejects are skipped. The subscription is dropped on return, which
/// unsubscribes it.
pub async fn forward<E, S, F>(
    mut subscription: Subscription<E>,
    sink: &mut S,
    mut encode: F,
    cancel: &CancellationToken,
) -> ForwardOutcome
where
    S: EventSink + ?Sized,
    F: FnMut(&E) -> Option<Vec<u8>>,
{
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return ForwardOutcome::Cancelled,
            event = subscription.recv() => event,
        };
        let Some(event) = event else {
            return ForwardOutcome::Closed;
        };
        let Some(frame) = encode(&event) else {
            continue;
        };
        if let Err(error) = sink.write_frame(&frame).await {
            debug!(subscriber = subscription.id(), %error, "Sink closed");
            return ForwardOutcome::Disconnected(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_each_event() {
        let hub = Broadcaster::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        let report = hub.publish(1u32);
        assert_eq!(report.delivered, 2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(1));
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let hub = Broadcaster::new(8);
        hub.publish("early");
        let mut late = hub.subscribe();
        assert_eq!(late.try_recv(), None);
        hub.publish("late");
        assert_eq!(late.recv().await, Some("late"));
    }

    #[tokio::test]
    async fn full_subscriber_loses_events_others_do_not() {
        let hub = Broadcaster::new(1);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        hub.publish(1);
        assert_eq!(fast.recv().await, Some(1));
        let report = hub.publish(2);
        assert_eq!(report, PublishReport { delivered: 1, dropped: 1, removed: 0 });
        assert_eq!(fast.recv().await, Some(2));
        assert_eq!(slow.recv().await, Some(1));
        assert_eq!(slow.try_recv(), None);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub: Broadcaster<u8> = Broadcaster::new(4);
        let sub = hub.subscribe();
        assert!(hub.unsubscribe(sub.id()));
        assert!(!hub.unsubscribe(sub.id()));
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let hub: Broadcaster<u8> = Broadcaster::new(4);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(1).delivered, 0);
    }

    struct VecSink(Vec<Vec<u8>>);

    #[async_trait]
    impl EventSink for VecSink {
        async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.0.push(frame.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn forward_stops_when_cancelled() {
        let hub = Broadcaster::new(4);
        let sub = hub.subscribe();
        hub.publish(7u8);
        let cancel = CancellationToken::new();
        let mut sink = VecSink(Vec::new());

        let task_cancel = cancel.clone();
        let canceller = tokio::spawn(async move {
            tokio::task::yield_now().await;
            task_cancel.cancel();
        });
        let outcome = forward(sub, &mut sink, |n| Some(vec![*n]), &cancel).await;
        canceller.await.unwrap();

        assert!(matches!(outcome, ForwardOutcome::Cancelled));
        assert_eq!(sink.0, vec![vec![7u8]]);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
