//! Topic-based publish/subscribe broker
//!
//! The broker ties together three pieces:
//!
//! - [`Router`]: `(method, topic pattern)` to handler chains
//! - [`Hub`]: live subscribers per exact topic, with drop-if-full fan-out
//! - [`Broker`]: the serialized event loop that dispatches SUB, UNSUB and
//!   MSG events and runs PUB handlers for topics while they have subscribers
//!
//! # Architecture
//!
//! ```text
//!                             Broker (Arc)
//!                  ┌──────────────────────────────────┐
//!   subscribe() ──►│ event queue ──► serve loop       │
//!   message()   ──►│                   │              │
//!                  │        Router::find(method, topic)
//!                  │                   │              │
//!                  │       spawn handler (TaskTracker)│
//!                  └───────────────────┬──────────────┘
//!                                      │ PUB handler
//!                                      ▼
//!                              ctx.publish(frame)
//!                                      │
//!                                      ▼
//!                  Hub ──try_send──► [Subscription] ──► HTTP / websocket
//! ```
//!
//! # Zero-Copy Fan-out
//!
//! Frames hold their pixels and JPEG bytes behind reference counts, so a
//! published frame is shared by every subscriber rather than copied.

pub mod context;
pub mod dispatch;
pub mod hub;
pub mod router;

pub use context::Context;
pub use dispatch::{Broker, BrokerBuilder};
pub use hub::{Hub, Subscription, TopicEvent, Unsubscriber};
pub use router::{Handler, HandlerFuture, Method, Middleware, Next, Params, Route, Router};
