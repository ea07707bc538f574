//! Broker event dispatch
//!
//! All events flow through one serialized queue, consumed by
//! [`Broker::serve`]:
//!
//! ```text
//!  Broker::subscribe ──► Sub{topic, reply} ───┐
//!  Broker::message ────► Msg{topic, reply} ───┤
//!  Hub (shard lock) ───► Activated/Deactivated├──► serve loop ──► route + middleware
//!                        Unsubscribed ────────┘         │            + handler task
//!                                                       └─► PUB task per active topic
//! ```
//!
//! A PUB handler starts when its topic gains its first subscriber and is
//! cancelled when the topic loses its last one. SUB handlers run before a
//! subscriber is registered and may reject it; UNSUB handlers run after a
//! subscription ends. A failing handler only ends its own task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::context::Context;
use super::hub::{Hub, Subscription, TopicEvent};
use super::router::{Handler, Method, Middleware, Router};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::stats::HubStats;

enum Event {
    Sub {
        topic: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Msg {
        topic: String,
        payload: Option<Value>,
        reply: oneshot::Sender<Result<()>>,
    },
    Topic(TopicEvent),
}

/// Collects routes and middleware before the broker starts
#[derive(Default)]
pub struct BrokerBuilder {
    router: Router,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add middleware that runs ahead of every route's own middleware
    pub fn with_middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Register a route with route-specific middleware
    pub fn route(
        mut self,
        method: Method,
        pattern: &str,
        handler: impl Handler,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        self.router.add(method, pattern, handler, middleware);
        self
    }

    /// Register a producer for topics matching `pattern`
    pub fn on_pub(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::Pub, pattern, handler, Vec::new())
    }

    /// Register an admission handler for subscriptions matching `pattern`
    pub fn on_sub(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::Sub, pattern, handler, Vec::new())
    }

    /// Register a handler run after subscriptions matching `pattern` end
    pub fn on_unsub(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::Unsub, pattern, handler, Vec::new())
    }

    /// Register a message handler for topics matching `pattern`
    pub fn on_msg(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::Msg, pattern, handler, Vec::new())
    }

    /// Freeze the routes and create the broker
    pub fn build(mut self) -> Broker {
        self.router.apply_global(&self.middleware);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let topic_events = events_tx.clone();
        let hub = Hub::with_listener(move |event| {
            // Only fails once the broker is gone, when nobody needs the event
            let _ = topic_events.send(Event::Topic(event));
        });

        Broker {
            inner: Arc::new(BrokerInner {
                router: self.router,
                hub,
                events: events_tx,
                pending: Mutex::new(Some(events_rx)),
                root: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }
}

struct BrokerInner {
    router: Router,
    hub: Hub,
    events: mpsc::UnboundedSender<Event>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    root: CancellationToken,
    tasks: TaskTracker,
}

/// Topic pub/sub broker
///
/// Cheap to clone; clones share the same routes, hub and event loop.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    /// The hub subscriptions are registered in
    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    /// The registered routes
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Hub-wide statistics
    pub fn stats(&self) -> HubStats {
        self.inner.hub.stats()
    }

    /// Whether the broker has shut down
    pub fn is_closed(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Subscribe to a topic.
    ///
    /// Runs the topic's SUB route first; an error from it rejects the
    /// subscription. Topics without a SUB route are always accepted. The
    /// first subscription to a topic starts its PUB route.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<Subscription> {
        let topic = topic.into();
        if self.is_closed() {
            return Err(Error::BrokerClosed);
        }

        let (reply, admitted) = oneshot::channel();
        self.inner
            .events
            .send(Event::Sub {
                topic: topic.clone(),
                reply,
            })
            .map_err(|_| Error::BrokerClosed)?;

        match admitted.await.map_err(|_| Error::BrokerClosed)? {
            Ok(()) => Ok(self.inner.hub.subscribe(topic, &self.inner.root)),
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Subscription rejected");
                Err(Error::SubscriptionRejected {
                    topic,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Subscribe to a topic for as long as `parent` is not cancelled.
    ///
    /// Same as [`Broker::subscribe`], with the subscription also ending when
    /// `parent` is cancelled, as a request token is on client disconnect.
    pub async fn subscribe_with(
        &self,
        topic: impl Into<String>,
        parent: &CancellationToken,
    ) -> Result<Subscription> {
        let subscription = self.subscribe(topic).await?;
        let unsubscriber = subscription.unsubscriber();
        let parent = parent.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => unsubscriber.unsubscribe(),
                _ = unsubscriber.token().cancelled() => {}
            }
        });
        Ok(subscription)
    }

    /// Send a one-shot message to a topic's MSG route and wait for its result
    pub async fn message(&self, topic: impl Into<String>, payload: Option<Value>) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.inner
            .events
            .send(Event::Msg {
                topic: topic.into(),
                payload,
                reply,
            })
            .map_err(|_| Error::BrokerClosed)?;
        result.await.map_err(|_| Error::BrokerClosed)?
    }

    /// Publish directly to a topic's subscribers
    pub fn publish(&self, topic: &str, frames: impl IntoIterator<Item = Frame>) -> usize {
        self.inner.hub.publish(topic, frames)
    }

    /// Run the event loop until `shutdown` is cancelled.
    ///
    /// On return every PUB task, handler task and subscription has been
    /// cancelled and drained.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let mut events = self
            .inner
            .pending
            .lock()
            .map_err(|_| Error::AlreadyServing)?
            .take()
            .ok_or(Error::AlreadyServing)?;

        tracing::info!(routes = self.inner.router.routes().len(), "Broker serving");

        let mut publishers: HashMap<String, CancellationToken> = HashMap::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.root.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event, &mut publishers),
                    None => break,
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Cancel everything and wait for spawned tasks to finish
    async fn shutdown(&self) {
        tracing::info!("Broker shutting down");
        self.inner.root.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.hub.drain().await;
        tracing::info!("Broker stopped");
    }

    fn dispatch(&self, event: Event, publishers: &mut HashMap<String, CancellationToken>) {
        match event {
            Event::Sub { topic, reply } => {
                self.run_replying(Method::Sub, topic, None, reply, |_| Ok(()));
            }
            Event::Msg {
                topic,
                payload,
                reply,
            } => {
                self.run_replying(Method::Msg, topic, payload, reply, |topic| {
                    Err(Error::NoRoute {
                        method: Method::Msg.as_str(),
                        topic: topic.to_string(),
                    })
                });
            }
            Event::Topic(TopicEvent::Activated(topic)) => {
                let token = self.inner.root.child_token();
                if self.spawn_handler(Method::Pub, &topic, None, token.clone()) {
                    if let Some(previous) = publishers.insert(topic, token) {
                        previous.cancel();
                    }
                }
            }
            Event::Topic(TopicEvent::Deactivated(topic)) => {
                if let Some(token) = publishers.remove(&topic) {
                    tracing::info!(topic = %topic, "Stopping publisher");
                    token.cancel();
                }
            }
            Event::Topic(TopicEvent::Unsubscribed(topic)) => {
                let token = self.inner.root.child_token();
                self.spawn_handler(Method::Unsub, &topic, None, token);
            }
        }
    }

    fn context(
        &self,
        method: Method,
        topic: &str,
        params: super::router::Params,
        payload: Option<Value>,
        token: CancellationToken,
        span: tracing::Span,
    ) -> Context {
        Context::new(method, topic, params, self.inner.hub.clone(), token)
            .with_payload(payload)
            .with_span(span)
    }

    /// Spawn a fire-and-forget handler. Returns false when no route matches.
    fn spawn_handler(
        &self,
        method: Method,
        topic: &str,
        payload: Option<Value>,
        token: CancellationToken,
    ) -> bool {
        let Some(found) = self.inner.router.find(method, topic) else {
            tracing::debug!(method = %method, topic = %topic, "No route");
            return false;
        };

        let span = tracing::info_span!("handler", method = %method, topic = %topic);
        let ctx = self.context(method, topic, found.params, payload, token.clone(), span.clone());
        let fut = found.route.run(ctx);
        if method == Method::Pub {
            tracing::info!(topic = %topic, pattern = found.route.pattern(), "Starting publisher");
        }

        let hub = self.inner.hub.clone();
        let topic = topic.to_string();
        self.inner.tasks.spawn(
            async move {
                let result = fut.await;
                log_outcome(method, &token, result);
                // A publisher that ends on its own leaves nobody to feed the
                // topic, so its subscribers are closed
                if method == Method::Pub && !token.is_cancelled() {
                    let closed = hub.close_topic(&topic);
                    if closed > 0 {
                        tracing::info!(subscribers = closed, "Closed topic after publisher ended");
                    }
                }
            }
            .instrument(span),
        );
        true
    }

    /// Spawn a handler whose result is sent back to a waiting caller
    fn run_replying(
        &self,
        method: Method,
        topic: String,
        payload: Option<Value>,
        reply: oneshot::Sender<Result<()>>,
        on_missing: impl FnOnce(&str) -> Result<()>,
    ) {
        let Some(found) = self.inner.router.find(method, &topic) else {
            let _ = reply.send(on_missing(&topic));
            return;
        };

        let token = self.inner.root.child_token();
        let span = tracing::info_span!("handler", method = %method, topic = %topic);
        let ctx = self.context(method, &topic, found.params, payload, token, span.clone());
        let fut = found.route.run(ctx);

        self.inner.tasks.spawn(
            async move {
                // The caller may have given up waiting
                let _ = reply.send(fut.await);
            }
            .instrument(span),
        );
    }
}

fn log_outcome(method: Method, token: &CancellationToken, result: Result<()>) {
    match result {
        Ok(()) if method == Method::Pub => tracing::info!("Publisher stopped"),
        Ok(()) => {}
        Err(e) if token.is_cancelled() || e.is_disconnect() => {
            tracing::debug!(error = %e, "Handler ended after cancellation")
        }
        Err(e) => tracing::error!(error = %e, "Handler failed"),
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("routes", &self.inner.router.routes().len())
            .field("hub", &self.inner.hub)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use image::RgbImage;

    use super::*;
    use crate::broker::router::Next;
    use crate::frame::{ImageFrame, Metadata};

    fn frame(label: &str) -> Frame {
        ImageFrame::new(RgbImage::new(2, 2), Metadata::new(label)).into()
    }

    async fn ticker(ctx: Context) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(5));
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = interval.tick() => {
                    ctx.publish(frame(ctx.topic()));
                }
            }
        }
    }

    fn start(broker: &Broker) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let shutdown = CancellationToken::new();
        let serving = broker.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { serving.serve(token).await });
        (shutdown, handle)
    }

    #[tokio::test]
    async fn test_publisher_runs_on_demand() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let (s, e) = (Arc::clone(&starts), Arc::clone(&stops));

        let broker = Broker::builder()
            .on_pub("/streams/:name", move |ctx: Context| {
                let (starts, stops) = (Arc::clone(&s), Arc::clone(&e));
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    let result = ticker(ctx).await;
                    stops.fetch_add(1, Ordering::SeqCst);
                    result
                }
            })
            .build();
        let (shutdown, handle) = start(&broker);

        let mut a = broker.subscribe("/streams/cam").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), a.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(received.metadata().is_some());

        let mut b = broker.subscribe("/streams/cam").await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(2), b.recv())
            .await
            .unwrap()
            .is_some());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        drop(a);
        drop(b);
        tokio::time::timeout(Duration::from_secs(2), async {
            while stops.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Re-subscribing starts a fresh publisher
        let mut c = broker.subscribe("/streams/cam").await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(2), c.recv())
            .await
            .unwrap()
            .is_some());
        assert_eq!(starts.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 2);

        // A frame may still be buffered, but the channel must close
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while c.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_finished_publisher_closes_topic() {
        let starts = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&starts);
        let broker = Broker::builder()
            .on_pub("/once", move |ctx: Context| {
                let starts = Arc::clone(&s);
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    // Wait for the subscriber to be registered before the one frame
                    while ctx.publish(frame("only")) == 0 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Ok(())
                }
            })
            .build();
        let (shutdown, handle) = start(&broker);

        let mut first = broker.subscribe("/once").await.unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            let mut frames = 0;
            while first.recv().await.is_some() {
                frames += 1;
            }
            frames
        })
        .await
        .expect("subscription stayed open after its publisher finished");
        assert_eq!(ended, 1);
        assert!(!broker.hub().has_topic("/once"));

        // The next subscriber starts a new publisher
        let mut second = broker.subscribe("/once").await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), second.recv())
            .await
            .unwrap();
        assert!(frame.is_some());
        assert_eq!(starts.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_with_follows_parent() {
        let broker = Broker::builder().on_pub("/ticks", ticker).build();
        let (shutdown, handle) = start(&broker);

        let request = CancellationToken::new();
        let mut sub = broker.subscribe_with("/ticks", &request).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .is_some());
        assert_eq!(broker.hub().subscriber_count("/ticks"), 1);

        request.cancel();
        tokio::time::timeout(Duration::from_secs(2), sub.done())
            .await
            .expect("subscription outlived its parent token");
        assert!(!broker.hub().has_topic("/ticks"));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unrouted_sub_is_accepted() {
        let broker = Broker::builder().build();
        let (shutdown, handle) = start(&broker);

        let mut sub = broker.subscribe("/nothing/here").await.unwrap();
        assert_eq!(broker.publish("/nothing/here", vec![frame("direct")]), 1);
        assert!(sub.recv().await.is_some());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sub_middleware_rejects() {
        let gate: Arc<dyn Middleware> = Arc::new(|ctx: Context, next: Next| async move {
            if ctx.wildcard() == Some("open") {
                next.run(ctx).await
            } else {
                Err(Error::handler("forbidden"))
            }
        });
        let broker = Broker::builder()
            .route(
                Method::Sub,
                "/private/*",
                |_ctx: Context| async { Ok(()) },
                vec![gate],
            )
            .build();
        let (shutdown, handle) = start(&broker);

        assert!(broker.subscribe("/private/open").await.is_ok());
        let rejected = broker.subscribe("/private/secret").await;
        assert!(matches!(rejected, Err(Error::SubscriptionRejected { .. })));
        assert!(!broker.hub().has_topic("/private/secret"));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_global_middleware_runs_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (global, route, handler) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));

        let route_middleware: Arc<dyn Middleware> = Arc::new(move |ctx: Context, next: Next| {
            route.lock().unwrap().push("route");
            next.run(ctx)
        });
        let broker = Broker::builder()
            .route(
                Method::Msg,
                "/ping",
                move |_ctx: Context| {
                    let order = Arc::clone(&handler);
                    async move {
                        order.lock().unwrap().push("handler");
                        Ok(())
                    }
                },
                vec![route_middleware],
            )
            .with_middleware(move |ctx: Context, next: Next| {
                global.lock().unwrap().push("global");
                next.run(ctx)
            })
            .build();
        let (shutdown, handle) = start(&broker);

        broker.message("/ping", None).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["global", "route", "handler"]);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_message_routing() {
        let broker = Broker::builder()
            .on_msg("/echo/:id", |ctx: Context| async move {
                match ctx.payload() {
                    Some(Value::String(s)) if s == "ok" => Ok(()),
                    _ => Err(Error::handler(format!("bad payload for {}", ctx.param("id").unwrap_or("")))),
                }
            })
            .build();
        let (shutdown, handle) = start(&broker);

        assert!(broker
            .message("/echo/1", Some(Value::String("ok".into())))
            .await
            .is_ok());
        assert!(matches!(
            broker.message("/echo/1", None).await,
            Err(Error::Handler(_))
        ));
        assert!(matches!(
            broker.message("/missing", None).await,
            Err(Error::NoRoute { .. })
        ));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failing_publisher_does_not_stop_broker() {
        let broker = Broker::builder()
            .on_pub("/broken", |_ctx: Context| async { Err(Error::handler("boom")) })
            .on_pub("/healthy", ticker)
            .build();
        let (shutdown, handle) = start(&broker);

        let _broken = broker.subscribe("/broken").await.unwrap();
        let mut healthy = broker.subscribe("/healthy").await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(2), healthy.recv())
            .await
            .unwrap()
            .is_some());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unsub_handler_runs() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let broker = Broker::builder()
            .on_unsub("/rooms/:room", move |ctx: Context| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(ctx.param("room").map(str::to_string));
                    Ok(())
                }
            })
            .build();
        let (shutdown, handle) = start(&broker);

        let sub = broker.subscribe("/rooms/lobby").await.unwrap();
        sub.unsubscribe();
        let room = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .flatten();
        assert_eq!(room.as_deref(), Some("lobby"));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_broker() {
        let broker = Broker::builder().build();
        let (shutdown, handle) = start(&broker);
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(broker.is_closed());
        assert!(matches!(
            broker.subscribe("/late").await,
            Err(Error::BrokerClosed)
        ));
        assert!(matches!(
            broker.serve(CancellationToken::new()).await,
            Err(Error::AlreadyServing)
        ));
    }
}
