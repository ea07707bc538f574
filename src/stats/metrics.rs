//! Statistics and metrics for the broker and frame pipelines
//!
//! All counters are best-effort: they use relaxed atomics and are never
//! consulted for correctness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Delivery counters for one subscription
#[derive(Debug, Default)]
pub struct SubscriberCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriberCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames placed in the subscriber's channel
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames discarded because the subscriber's channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Running totals kept by the hub
#[derive(Debug, Default)]
pub(crate) struct HubCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl HubCounters {
    pub(crate) fn record_publish(&self, delivered: u64, dropped: u64) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, topics: usize, subscribers: usize) -> HubStats {
        HubStats {
            published_batches: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            topics,
            subscribers,
        }
    }
}

/// Hub-wide statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Non-empty batches published, to any topic
    pub published_batches: u64,
    /// Frames placed in subscriber channels
    pub delivered: u64,
    /// Frames discarded for full subscriber channels
    pub dropped: u64,
    /// Topics with at least one subscriber
    pub topics: usize,
    /// Live subscriptions across all topics
    pub subscribers: usize,
}

impl HubStats {
    /// Fraction of fan-out attempts that were dropped
    pub fn drop_ratio(&self) -> f64 {
        let attempts = self.delivered + self.dropped;
        if attempts > 0 {
            self.dropped as f64 / attempts as f64
        } else {
            0.0
        }
    }
}

/// Sliding-window frame rate counter
///
/// Counts the ticks seen during the last `window`. Used for the frame rate
/// shown in annotation bars.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    window: Duration,
    ticks: VecDeque<Instant>,
}

impl FpsCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ticks: VecDeque::new(),
        }
    }

    /// Record a frame at `now`
    pub fn tick(&mut self, now: Instant) {
        self.ticks.push_back(now);
        self.expire(now);
    }

    /// Frames counted within the window ending at `now`
    pub fn count(&mut self, now: Instant) -> u64 {
        self.expire(now);
        self.ticks.len() as u64
    }

    /// Length of the counting window in seconds
    pub fn period(&self) -> f32 {
        self.window.as_secs_f32()
    }

    /// Frames per second over the window ending at `now`
    pub fn rate(&mut self, now: Instant) -> f32 {
        let period = self.period();
        if period > 0.0 {
            self.count(now) as f32 / period
        } else {
            0.0
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.ticks.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_counters() {
        let counters = SubscriberCounters::new();
        counters.record_delivered();
        counters.record_dropped();
        counters.record_dropped();

        assert_eq!(counters.delivered(), 1);
        assert_eq!(counters.dropped(), 2);
    }

    #[test]
    fn test_hub_counters_snapshot() {
        let counters = HubCounters::default();
        counters.record_publish(3, 1);
        counters.record_publish(2, 2);

        let stats = counters.snapshot(2, 5);
        assert_eq!(stats.published_batches, 2);
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.topics, 2);
        assert_eq!(stats.subscribers, 5);
        assert!((stats.drop_ratio() - 0.375).abs() < f64::EPSILON);
    }

    #[test]
    fn test_drop_ratio_empty() {
        assert_eq!(HubStats::default().drop_ratio(), 0.0);
    }

    #[test]
    fn test_fps_counter_window() {
        let start = Instant::now();
        let mut fps = FpsCounter::new(Duration::from_secs(2));

        for i in 0..20 {
            fps.tick(start + Duration::from_millis(i * 100));
        }
        // All 20 ticks fall inside [0.0s, 1.9s]
        assert_eq!(fps.count(start + Duration::from_millis(1900)), 20);
        assert!((fps.rate(start + Duration::from_millis(1900)) - 10.0).abs() < 0.01);

        // 3s later only the ticks at 1.0s..=1.9s remain
        assert_eq!(fps.count(start + Duration::from_millis(3000)), 10);
        assert_eq!(fps.count(start + Duration::from_secs(10)), 0);
    }

    #[test]
    fn test_fps_counter_period() {
        let fps = FpsCounter::new(Duration::from_millis(2500));
        assert_eq!(fps.period(), 2.5);
    }
}
