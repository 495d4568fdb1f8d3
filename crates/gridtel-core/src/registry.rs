//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Registry of live subscribers and fan-out of new readings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gridtel_metrics::PipelineMetrics;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Registry-assigned identity of one live subscriber.
pub type SubscriberId = u64;

/// Messages committed together; queued as one item per subscriber.
pub type MessageBatch = Arc<[Arc<str>]>;

type Outbox = mpsc::Sender<MessageBatch>;

struct RegistryInner {
    subscribers: RwLock<IndexMap<SubscriberId, Outbox>>,
    next_id: AtomicU64,
    capacity: usize,
    metrics: Option<PipelineMetrics>,
}

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Messages accepted across all subscriber queues.
    pub delivered: usize,
    /// Subscribers removed because delivery failed.
    pub dropped: usize,
}

/// Thread-safe set of live subscribers.
///
/// Each subscriber owns a queue bounded to `capacity` batches, whatever their
/// size. Broadcasting never waits on a subscriber: a closed queue (client gone)
/// or a full queue (client not draining) counts as a failed delivery and
/// removes that subscriber, which in turn ends its connection task once the
/// queue drains.
#[derive(Clone)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscribers: RwLock::new(IndexMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                metrics: None,
            }),
        }
    }

    pub fn with_metrics(capacity: usize, metrics: PipelineMetrics) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscribers: RwLock::new(IndexMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                metrics: Some(metrics),
            }),
        }
    }

    /// Add a fresh subscriber. Only messages broadcast after this call reach it.
    pub fn register(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let active = {
            let mut subscribers = self.inner.subscribers.write();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        self.publish_count(active);
        debug!(subscriber = id, active, "subscriber registered");
        Subscription {
            id,
            receiver: rx,
            pending: VecDeque::new(),
            registry: self.clone(),
        }
    }

    /// Remove a subscriber. Absent ids are ignored since disconnects and failed
    /// deliveries race to clean up the same entry.
    pub fn unregister(&self, id: SubscriberId) {
        let (removed, active) = {
            let mut subscribers = self.inner.subscribers.write();
            let removed = subscribers.shift_remove(&id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            self.publish_count(active);
            debug!(subscriber = id, active, "subscriber unregistered");
        }
    }

    /// Deliver `message` to every registered subscriber without blocking.
    pub fn broadcast(&self, message: Arc<str>) -> BroadcastReport {
        self.broadcast_batch(Arc::from(vec![message]))
    }

    /// Deliver `batch` to every registered subscriber as a single queue item.
    /// Subscribers read the messages back one at a time, in batch order.
    pub fn broadcast_batch(&self, batch: MessageBatch) -> BroadcastReport {
        if batch.is_empty() {
            return BroadcastReport::default();
        }

        let snapshot: Vec<(SubscriberId, Outbox)> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(id, outbox)| (*id, outbox.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, outbox) in snapshot {
            match outbox.try_send(Arc::clone(&batch)) {
                Ok(()) => report.delivered += batch.len(),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscriber = id,
                        capacity = self.inner.capacity,
                        "subscriber queue full; dropping subscriber"
                    );
                    failed.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(subscriber = id, "subscriber channel closed; dropping subscriber");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let active = {
                let mut subscribers = self.inner.subscribers.write();
                for id in &failed {
                    if subscribers.shift_remove(id).is_some() {
                        report.dropped += 1;
                    }
                }
                subscribers.len()
            };
            self.publish_count(active);
        }

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_broadcast(report.delivered, report.dropped);
        }
        report
    }

    pub fn len(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.subscribers.read().is_empty()
    }

    fn publish_count(&self, active: usize) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_subscribers(active);
        }
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// Receiving side of one subscriber. Dropping it unregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<MessageBatch>,
    pending: VecDeque<Arc<str>>,
    registry: SubscriberRegistry,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next broadcast message; `None` once the registry dropped this subscriber
    /// and the queue is drained.
    /// Cancel safe: a batch taken off the queue is buffered before returning.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            let batch = self.receiver.recv().await?;
            self.pending.extend(batch.iter().cloned());
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            let batch = self.receiver.try_recv().ok()?;
            self.pending.extend(batch.iter().cloned());
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let registry = SubscriberRegistry::new(8);
        let mut a = registry.register();
        let mut b = registry.register();
        assert_ne!(a.id(), b.id());

        let report = registry.broadcast(message("one"));
        assert_eq!(report, BroadcastReport { delivered: 2, dropped: 0 });
        assert_eq!(a.try_recv().as_deref(), Some("one"));
        assert_eq!(b.try_recv().as_deref(), Some("one"));
    }

    #[test]
    fn late_subscribers_miss_earlier_messages() {
        let registry = SubscriberRegistry::new(8);
        registry.broadcast(message("early"));
        let mut late = registry.register();
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = SubscriberRegistry::new(8);
        let subscription = registry.register();
        let id = subscription.id();
        registry.unregister(id);
        registry.unregister(id);
        assert!(registry.is_empty());
        drop(subscription);
        assert!(registry.is_empty());
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let registry = SubscriberRegistry::new(8);
        let subscription = registry.register();
        assert_eq!(registry.len(), 1);
        drop(subscription);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn full_queue_drops_only_the_stuck_subscriber() {
        let registry = SubscriberRegistry::new(1);
        let _stuck = registry.register();
        let mut healthy = registry.register();

        assert_eq!(registry.broadcast(message("first")).delivered, 2);
        assert_eq!(healthy.try_recv().as_deref(), Some("first"));

        let report = registry.broadcast(message("second"));
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert_eq!(healthy.try_recv().as_deref(), Some("second"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn closed_outbox_is_removed_on_broadcast() {
        let registry = SubscriberRegistry::new(4);
        // An outbox whose receiver is already gone, as left behind by a
        // connection task torn down mid-broadcast.
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        registry.inner.subscribers.write().insert(999, tx);

        let mut other = registry.register();
        let report = registry.broadcast(message("ping"));
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert_eq!(other.try_recv().as_deref(), Some("ping"));
        assert!(!registry.inner.subscribers.read().contains_key(&999));
    }

    #[test]
    fn batch_larger_than_capacity_occupies_one_slot() {
        let registry = SubscriberRegistry::new(2);
        let mut subscription = registry.register();
        let batch: MessageBatch = (0..10).map(|i| message(&i.to_string())).collect();

        let report = registry.broadcast_batch(batch);
        assert_eq!(report, BroadcastReport { delivered: 10, dropped: 0 });
        assert_eq!(registry.broadcast(message("tail")).delivered, 1);
        assert_eq!(registry.len(), 1);

        let mut received = Vec::new();
        while let Some(text) = subscription.try_recv() {
            received.push(text.to_string());
        }
        let mut expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        expected.push("tail".into());
        assert_eq!(received, expected);
    }

    #[test]
    fn empty_batch_is_not_queued() {
        let registry = SubscriberRegistry::new(1);
        let mut subscription = registry.register();
        let report = registry.broadcast_batch(Arc::from(Vec::<Arc<str>>::new()));
        assert_eq!(report, BroadcastReport::default());
        assert!(subscription.try_recv().is_none());
        assert_eq!(registry.broadcast(message("next")).delivered, 1);
    }

    #[tokio::test]
    async fn removed_subscriber_sees_end_of_stream() {
        let registry = SubscriberRegistry::new(1);
        let mut subscription = registry.register();
        registry.broadcast(message("a"));
        registry.broadcast(message("b"));
        assert_eq!(subscription.recv().await.as_deref(), Some("a"));
        assert_eq!(subscription.recv().await, None);
    }
}
