//! Statistics and metrics

pub mod metrics;

pub use metrics::{FpsCounter, HubStats, SubscriberCounters};
