//! Per-topic fan-out
//!
//! The hub keeps the live subscribers of every exact topic string. Each
//! subscriber owns a capacity-1 channel; publishing a batch tries a
//! non-blocking send of the batch's last frame to every subscriber and drops
//! it for subscribers whose channel is still full.
//!
//! ```text
//!                        Hub (DashMap<topic, TopicEntry>)
//!                     ┌───────────────────────────────┐
//!   publish(topic, ──►│ snapshot Arc<SubscriberSlot>s │
//!     [f1, f2])       └───────────────┬───────────────┘
//!                                     │ try_send(f2)
//!               ┌─────────────────────┼─────────────────────┐
//!               ▼                     ▼                     ▼
//!        [cap 1: f2]            [cap 1: full]          [cap 1: f2]
//!        delivered              dropped                delivered
//! ```
//!
//! A topic entry exists exactly while it has subscribers. Removing the last
//! subscriber deletes the entry in the same shard-locked step that emits
//! [`TopicEvent::Deactivated`]. A subscriber's channel closes once its slot
//! has been removed and every in-flight publish holding the slot has
//! finished with it, since the slot owns the only sender.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::frame::Frame;
use crate::stats::metrics::HubCounters;
use crate::stats::{HubStats, SubscriberCounters};

/// Delivery channel capacity per subscriber
pub const SUBSCRIBER_CAPACITY: usize = 1;

/// Topic lifecycle notifications
///
/// Emitted while the topic's shard lock is held, so events for one topic
/// are observed in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicEvent {
    /// The topic gained its first subscriber
    Activated(String),
    /// The topic lost its last subscriber
    Deactivated(String),
    /// A subscription to the topic ended
    Unsubscribed(String),
}

type TopicListener = Box<dyn Fn(TopicEvent) + Send + Sync>;

struct SubscriberSlot {
    tx: mpsc::Sender<Frame>,
    counters: Arc<SubscriberCounters>,
    token: CancellationToken,
}

#[derive(Default)]
struct TopicEntry {
    subscribers: HashMap<u64, Arc<SubscriberSlot>>,
}

struct HubInner {
    topics: DashMap<String, TopicEntry>,
    next_id: AtomicU64,
    counters: HubCounters,
    listener: Option<TopicListener>,
    watchers: TaskTracker,
}

impl HubInner {
    fn emit(&self, event: TopicEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    fn remove(&self, topic: &str, id: u64) {
        let Entry::Occupied(mut occupied) = self.topics.entry(topic.to_string()) else {
            return;
        };
        if occupied.get_mut().subscribers.remove(&id).is_none() {
            return;
        }

        let remaining = occupied.get().subscribers.len();
        tracing::debug!(topic = %topic, subscriber = id, subscribers = remaining, "Subscriber removed");
        self.emit(TopicEvent::Unsubscribed(topic.to_string()));

        if remaining == 0 {
            self.emit(TopicEvent::Deactivated(topic.to_string()));
            occupied.remove();
            tracing::debug!(topic = %topic, "Topic deactivated");
        }
    }

    fn close(&self, topic: &str) -> usize {
        let Entry::Occupied(occupied) = self.topics.entry(topic.to_string()) else {
            return 0;
        };

        let closed = occupied.get().subscribers.len();
        for _ in 0..closed {
            self.emit(TopicEvent::Unsubscribed(topic.to_string()));
        }
        self.emit(TopicEvent::Deactivated(topic.to_string()));
        let entry = occupied.remove();

        // Dropping the slots closes each channel after its buffered frame
        for slot in entry.subscribers.into_values() {
            slot.token.cancel();
        }
        tracing::debug!(topic = %topic, subscribers = closed, "Topic closed");
        closed
    }
}

/// Fan-out registry of topic subscribers
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a standalone hub
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a hub that reports topic lifecycle events to `listener`.
    ///
    /// The listener runs under the topic's shard lock and must not block or
    /// touch the hub.
    pub fn with_listener(listener: impl Fn(TopicEvent) + Send + Sync + 'static) -> Self {
        Self::build(Some(Box::new(listener)))
    }

    fn build(listener: Option<TopicListener>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: DashMap::new(),
                next_id: AtomicU64::new(1),
                counters: HubCounters::default(),
                listener,
                watchers: TaskTracker::new(),
            }),
        }
    }

    /// Subscribe to an exact topic string.
    ///
    /// The subscription lives until it is unsubscribed, dropped, or
    /// `parent` is cancelled. Must be called within a tokio runtime.
    pub fn subscribe(&self, topic: impl Into<String>, parent: &CancellationToken) -> Subscription {
        let topic: String = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let counters = Arc::new(SubscriberCounters::new());
        let token = parent.child_token();
        let slot = Arc::new(SubscriberSlot {
            tx,
            counters: Arc::clone(&counters),
            token: token.clone(),
        });

        match self.inner.topics.entry(topic.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().subscribers.insert(id, slot);
                tracing::debug!(
                    topic = %topic,
                    subscriber = id,
                    subscribers = occupied.get().subscribers.len(),
                    "Subscriber added"
                );
            }
            Entry::Vacant(vacant) => {
                let mut entry = vacant.insert(TopicEntry::default());
                entry.subscribers.insert(id, slot);
                self.inner.emit(TopicEvent::Activated(topic.clone()));
                tracing::debug!(topic = %topic, subscriber = id, "Topic activated");
            }
        }

        let unsubscriber = Unsubscriber {
            hub: Arc::clone(&self.inner),
            topic: Arc::from(topic.as_str()),
            id,
            token: token.clone(),
        };

        let watcher = unsubscriber.clone();
        self.inner.watchers.spawn(async move {
            watcher.token.cancelled().await;
            watcher.hub.remove(&watcher.topic, watcher.id);
        });

        Subscription {
            rx,
            counters,
            unsubscriber,
        }
    }

    /// Deliver the last frame of `frames` to every subscriber of `topic`.
    ///
    /// Never blocks. Returns how many subscribers received the frame.
    pub fn publish(&self, topic: &str, frames: impl IntoIterator<Item = Frame>) -> usize {
        let Some(frame) = frames.into_iter().last() else {
            return 0;
        };

        // Hold the shard lock only long enough to copy the subscriber list
        let slots: Vec<Arc<SubscriberSlot>> = match self.inner.topics.get(topic) {
            Some(entry) => entry.subscribers.values().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for slot in &slots {
            match slot.tx.try_send(frame.clone()) {
                Ok(()) => {
                    slot.counters.record_delivered();
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    slot.counters.record_dropped();
                    dropped += 1;
                }
                // Receiver already gone; removal is in progress
                Err(TrySendError::Closed(_)) => {}
            }
        }

        self.inner.counters.record_publish(delivered, dropped);
        delivered as usize
    }

    /// End every subscription to `topic` at once.
    ///
    /// Subscribers still read a frame already delivered, then see the end of
    /// the stream. Emits one `Unsubscribed` per subscriber followed by
    /// `Deactivated`, so a later subscribe activates the topic afresh.
    /// Returns how many subscriptions were closed.
    pub fn close_topic(&self, topic: &str) -> usize {
        self.inner.close(topic)
    }

    /// Number of live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Whether `topic` has at least one subscriber
    pub fn has_topic(&self, topic: &str) -> bool {
        self.inner.topics.contains_key(topic)
    }

    /// Number of topics with subscribers
    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }

    /// Snapshot of hub-wide counters
    pub fn stats(&self) -> HubStats {
        let subscribers = self
            .inner
            .topics
            .iter()
            .map(|entry| entry.subscribers.len())
            .sum();
        self.inner.counters.snapshot(self.topic_count(), subscribers)
    }

    /// Wait for every subscription watcher to finish.
    ///
    /// Call after cancelling the parent tokens of all subscriptions.
    pub async fn drain(&self) {
        self.inner.watchers.close();
        self.inner.watchers.wait().await;
        self.inner.watchers.reopen();
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("topics", &self.topic_count())
            .finish()
    }
}

/// Cloneable handle that ends a subscription
#[derive(Clone)]
pub struct Unsubscriber {
    hub: Arc<HubInner>,
    topic: Arc<str>,
    id: u64,
    token: CancellationToken,
}

impl Unsubscriber {
    /// Remove the subscription from its topic. Idempotent.
    ///
    /// Once this returns, no later publish can reach the subscription.
    pub fn unsubscribe(&self) {
        self.hub.remove(&self.topic, self.id);
        self.token.cancel();
    }

    /// Token cancelled when the subscription ends
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl fmt::Debug for Unsubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscriber")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

/// A live subscription to one topic
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    rx: mpsc::Receiver<Frame>,
    counters: Arc<SubscriberCounters>,
    unsubscriber: Unsubscriber,
}

impl Subscription {
    /// Wait for the next frame.
    ///
    /// Returns `None` once the subscription has ended and any frame already
    /// delivered has been read.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Take a delivered frame without waiting
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// The subscribed topic
    pub fn topic(&self) -> &str {
        &self.unsubscriber.topic
    }

    /// Handle that can end this subscription from elsewhere
    pub fn unsubscriber(&self) -> Unsubscriber {
        self.unsubscriber.clone()
    }

    /// End the subscription
    pub fn unsubscribe(&self) {
        self.unsubscriber.unsubscribe();
    }

    /// Completes when the subscription has ended
    pub async fn done(&self) {
        self.unsubscriber.token.cancelled().await;
    }

    /// Whether the subscription has ended
    pub fn is_done(&self) -> bool {
        self.unsubscriber.token.is_cancelled()
    }

    /// Frames delivered to this subscription
    pub fn delivered(&self) -> u64 {
        self.counters.delivered()
    }

    /// Frames dropped because this subscription had not read the last one
    pub fn dropped(&self) -> u64 {
        self.counters.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscriber.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic())
            .field("delivered", &self.delivered())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use image::RgbImage;

    use super::*;
    use crate::frame::{ImageFrame, Metadata};

    fn frame(label: &str) -> Frame {
        ImageFrame::new(RgbImage::new(2, 2), Metadata::new(label)).into()
    }

    fn origin(frame: &Frame) -> String {
        frame
            .metadata()
            .and_then(|m| m.operations.last())
            .map(|op| op.to_string())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_publish_delivers_last_frame_of_batch() {
        let hub = Hub::new();
        let root = CancellationToken::new();
        let mut sub = hub.subscribe("X", &root);

        let delivered = hub.publish("X", vec![frame("f1"), frame("f2")]);
        assert_eq!(delivered, 1);

        let received = sub.recv().await.unwrap();
        assert_eq!(origin(&received), "f2");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_topic_is_noop() {
        let hub = Hub::new();
        assert_eq!(hub.publish("nobody", vec![frame("f")]), 0);
        assert_eq!(hub.publish("nobody", Vec::new()), 0);
        assert_eq!(hub.stats().published_batches, 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_never_blocks_fast_one() {
        let hub = Hub::new();
        let root = CancellationToken::new();
        let slow = hub.subscribe("Y", &root);
        let mut fast = hub.subscribe("Y", &root);

        let mut fast_seen = 0;
        for i in 0..1000 {
            hub.publish("Y", vec![frame(&format!("f{i}"))]);
            if fast.try_recv().is_some() {
                fast_seen += 1;
            }
        }

        assert_eq!(fast_seen, 1000);
        assert_eq!(slow.delivered(), 1);
        assert!(slow.dropped() >= 999);

        let stats = hub.stats();
        assert_eq!(stats.published_batches, 1000);
        assert_eq!(stats.delivered, 1001);
        assert_eq!(stats.dropped, 999);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel_and_removes_topic() {
        let hub = Hub::new();
        let root = CancellationToken::new();
        let mut sub = hub.subscribe("Z", &root);
        assert!(hub.has_topic("Z"));

        sub.unsubscribe();
        assert!(sub.is_done());
        assert!(!hub.has_topic("Z"));

        assert_eq!(hub.publish("Z", vec![frame("late")]), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_entry_kept_until_last_subscriber_leaves() {
        let hub = Hub::new();
        let root = CancellationToken::new();
        let a = hub.subscribe("T", &root);
        let b = hub.subscribe("T", &root);
        assert_eq!(hub.subscriber_count("T"), 2);

        drop(a);
        assert_eq!(hub.subscriber_count("T"), 1);
        assert!(hub.has_topic("T"));

        drop(b);
        assert!(!hub.has_topic("T"));
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_ends_subscription() {
        let hub = Hub::new();
        let root = CancellationToken::new();
        let mut sub = hub.subscribe("C", &root);

        root.cancel();
        let ended = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await;
        assert!(matches!(ended, Ok(None)));
        assert!(!hub.has_topic("C"));

        hub.drain().await;
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let hub = Hub::with_listener(move |event| {
            if let Ok(mut events) = sink.lock() {
                events.push(event);
            }
        });
        let root = CancellationToken::new();

        let a = hub.subscribe("L", &root);
        let b = hub.subscribe("L", &root);
        a.unsubscribe();
        a.unsubscribe();
        drop(b);

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                TopicEvent::Activated("L".into()),
                TopicEvent::Unsubscribed("L".into()),
                TopicEvent::Unsubscribed("L".into()),
                TopicEvent::Deactivated("L".into()),
            ]
        );
        drop(a);
    }

    #[tokio::test]
    async fn test_close_topic_ends_every_subscription() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let hub = Hub::with_listener(move |event| {
            if let Ok(mut events) = sink.lock() {
                events.push(event);
            }
        });
        let root = CancellationToken::new();
        let mut a = hub.subscribe("K", &root);
        let mut b = hub.subscribe("K", &root);
        hub.publish("K", vec![frame("last")]);

        assert_eq!(hub.close_topic("K"), 2);
        assert!(!hub.has_topic("K"));
        assert!(a.is_done());
        assert_eq!(hub.close_topic("K"), 0);

        assert_eq!(origin(&a.recv().await.unwrap()), "last");
        assert!(a.recv().await.is_none());
        assert_eq!(origin(&b.recv().await.unwrap()), "last");
        assert!(b.recv().await.is_none());

        // A new subscriber activates the topic again
        let c = hub.subscribe("K", &root);
        drop(a);
        drop(b);
        assert_eq!(hub.subscriber_count("K"), 1);
        drop(c);

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                TopicEvent::Activated("K".into()),
                TopicEvent::Unsubscribed("K".into()),
                TopicEvent::Unsubscribed("K".into()),
                TopicEvent::Deactivated("K".into()),
                TopicEvent::Activated("K".into()),
                TopicEvent::Unsubscribed("K".into()),
                TopicEvent::Deactivated("K".into()),
            ]
        );
        hub.drain().await;
    }

    #[tokio::test]
    async fn test_concurrent_publishers_and_subscribers() {
        let hub = Hub::new();
        let root = CancellationToken::new();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let hub = hub.clone();
            let root = root.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let mut sub = hub.subscribe("race", &root);
                    hub.publish("race", vec![frame("x")]);
                    let _ = sub.try_recv();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(!hub.has_topic("race"));
        assert_eq!(hub.stats().subscribers, 0);
    }
}
