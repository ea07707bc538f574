//! Handler context
//!
//! Context passed to route handlers and middleware, binding the event's
//! topic, the parameters its route bound, the hub, and the cancellation
//! token for the handler's lifetime.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::hub::{Hub, Subscription};
use super::router::{topic_path, Method, Params, WILDCARD_PARAM};
use crate::error::{Error, Result};
use crate::frame::Frame;

/// Context passed to handlers
///
/// Cheap to clone. PUB handlers should publish until
/// [`Context::cancelled`] completes and then return `Ok(())`.
#[derive(Debug, Clone)]
pub struct Context {
    method: Method,
    topic: Arc<str>,
    params: Arc<Params>,
    hub: Hub,
    token: CancellationToken,
    payload: Option<Arc<Value>>,
    span: tracing::Span,
}

impl Context {
    /// Create a new context
    pub fn new(
        method: Method,
        topic: impl AsRef<str>,
        params: Params,
        hub: Hub,
        token: CancellationToken,
    ) -> Self {
        Self {
            method,
            topic: Arc::from(topic.as_ref()),
            params: Arc::new(params),
            hub,
            token,
            payload: None,
            span: tracing::Span::none(),
        }
    }

    /// Attach a message payload
    pub fn with_payload(mut self, payload: Option<Value>) -> Self {
        self.payload = payload.map(Arc::new);
        self
    }

    /// Attach the span the handler runs in
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// The event method
    pub fn method(&self) -> Method {
        self.method
    }

    /// The full topic, including any query string
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The topic without its query string
    pub fn path(&self) -> &str {
        topic_path(&self.topic)
    }

    /// All parameters bound by the route pattern
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// A parameter bound by the route pattern
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// A required parameter
    pub fn require_param(&self, name: &str) -> Result<&str> {
        self.param(name)
            .ok_or_else(|| Error::InvalidParam(format!("missing route parameter {name}")))
    }

    /// The suffix matched by a trailing wildcard
    pub fn wildcard(&self) -> Option<&str> {
        self.param(WILDCARD_PARAM)
    }

    /// Decoded `key=value` pairs from the topic's query string
    pub fn query(&self) -> Vec<(String, String)> {
        match self.topic.split_once('?') {
            Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// First value of a query key
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// The payload of a MSG event
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_deref()
    }

    /// The hub the broker publishes through
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Publish one frame to this context's topic
    pub fn publish(&self, frame: Frame) -> usize {
        self.hub.publish(&self.topic, std::iter::once(frame))
    }

    /// Publish a batch; subscribers receive only its last frame
    pub fn publish_batch(&self, frames: impl IntoIterator<Item = Frame>) -> usize {
        self.hub.publish(&self.topic, frames)
    }

    /// Subscribe to another topic for as long as this handler runs.
    ///
    /// Goes straight to the hub, so the topic's SUB route is not consulted,
    /// but its PUB route still starts on demand.
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        self.hub.subscribe(topic, &self.token)
    }

    /// The token cancelled when this handler should stop
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Completes when this handler should stop
    pub fn cancelled(&self) -> impl Future<Output = ()> + '_ {
        self.token.cancelled()
    }

    /// Whether this handler should stop
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The span this handler runs in
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}
