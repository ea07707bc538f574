//! Cable channels
//!
//! A channel is created per subscribe command by the factory registered for
//! the identifier's `channel` name, after every identifier checker has
//! accepted the identifier. The video channel subscribes to a broker topic
//! and forwards its frames to the client as base64 JPEG strings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::{Identifier, ServerMessage};
use crate::broker::Broker;
use crate::error::{Error, Result};

/// Channel name of video stream subscriptions
pub const VIDEO_STREAMS_CHANNEL: &str = "Video::StreamsChannel";

/// Future streaming one subscription's data until it is cancelled
pub type StreamTask = BoxFuture<'static, Result<()>>;

/// A client's subscription to a channel
#[derive(Debug, Clone)]
pub struct CableSubscription {
    identifier: Arc<str>,
    outbound: mpsc::Sender<ServerMessage>,
    token: CancellationToken,
}

impl CableSubscription {
    pub(crate) fn new(
        identifier: &str,
        outbound: mpsc::Sender<ServerMessage>,
        token: CancellationToken,
    ) -> Self {
        Self {
            identifier: Arc::from(identifier),
            outbound,
            token,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Queue channel data for the client.
    ///
    /// Waits while the connection's outbound queue is full. Fails once the
    /// subscription is cancelled or the connection is gone.
    pub async fn send(&self, message: Value) -> Result<()> {
        let envelope = ServerMessage::message(self.identifier.as_ref(), message);
        tokio::select! {
            _ = self.token.cancelled() => Err(Error::BrokerClosed),
            sent = self.outbound.send(envelope) => sent.map_err(|_| Error::BrokerClosed),
        }
    }

    /// Completes when the client unsubscribes or the connection closes
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Server side of a channel subscription
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Accept the subscription and return the task that streams to it.
    ///
    /// An error rejects the subscription.
    async fn subscribe(&self, subscription: CableSubscription) -> Result<StreamTask>;

    /// Handle an action sent by the client
    async fn perform(&self, data: &str) -> Result<()>;
}

/// Creates a channel from a raw subscription identifier
pub type ChannelFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Channel>> + Send + Sync>;

/// Accepts or rejects a raw subscription identifier
pub type IdentifierChecker = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Validates the CSRF token a client embedded in its identifier
pub trait TokenChecker: Send + Sync + 'static {
    fn check(&self, token: &str) -> Result<()>;
}

impl<F> TokenChecker for F
where
    F: Fn(&str) -> Result<()> + Send + Sync + 'static,
{
    fn check(&self, token: &str) -> Result<()> {
        self(token)
    }
}

/// Identifier checker requiring a `csrfToken` accepted by `checker`
pub fn csrf_checker(checker: Arc<dyn TokenChecker>) -> IdentifierChecker {
    Arc::new(move |raw: &str| {
        let identifier = Identifier::parse(raw)?;
        let token = identifier
            .csrf_token
            .ok_or_else(|| Error::Identifier("missing csrf token".into()))?;
        checker
            .check(&token)
            .map_err(|e| Error::Identifier(format!("csrf token check failed: {e}")))
    })
}

/// Channel factories keyed by channel name, plus checkers shared by all
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    factories: HashMap<String, ChannelFactory>,
    checkers: Vec<IdentifierChecker>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `channel`
    pub fn with_factory(mut self, channel: impl Into<String>, factory: ChannelFactory) -> Self {
        self.factories.insert(channel.into(), factory);
        self
    }

    /// Add a checker every identifier must pass
    pub fn with_checker(mut self, checker: IdentifierChecker) -> Self {
        self.checkers.push(checker);
        self
    }

    /// Create the channel for a raw identifier
    pub fn create(&self, raw: &str) -> Result<Arc<dyn Channel>> {
        let identifier = Identifier::parse(raw)?;
        let factory = self.factories.get(&identifier.channel).ok_or_else(|| {
            Error::Identifier(format!("unknown channel {}", identifier.channel))
        })?;
        for checker in &self.checkers {
            checker(raw)?;
        }
        factory(raw)
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut channels: Vec<&String> = self.factories.keys().collect();
        channels.sort();
        f.debug_struct("ChannelRegistry")
            .field("channels", &channels)
            .field("checkers", &self.checkers.len())
            .finish()
    }
}

/// Channel streaming one broker topic as base64 JPEG frames
#[derive(Debug, Clone)]
pub struct VideoStreamChannel {
    identifier: String,
    stream: String,
    broker: Broker,
}

impl VideoStreamChannel {
    /// Create a channel for the topic named by the identifier's `name`
    pub fn new(identifier: &str, broker: Broker) -> Result<Self> {
        let stream = Identifier::parse(identifier)?
            .name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Identifier("missing stream name".into()))?;
        Ok(Self {
            identifier: identifier.to_string(),
            stream,
            broker,
        })
    }

    /// The broker topic this channel streams
    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl Channel for VideoStreamChannel {
    async fn subscribe(&self, subscription: CableSubscription) -> Result<StreamTask> {
        if subscription.identifier() != self.identifier {
            return Err(Error::Identifier(format!(
                "channel identifier {} does not match subscription identifier {}",
                self.identifier,
                subscription.identifier()
            )));
        }

        let mut frames = self.broker.subscribe(self.stream.clone()).await?;
        let stream = self.stream.clone();
        Ok(Box::pin(async move {
            loop {
                let frame = tokio::select! {
                    _ = subscription.cancelled() => break,
                    frame = frames.recv() => frame,
                };
                let Some(frame) = frame else {
                    break;
                };
                let jpeg = match frame.as_jpeg_frame() {
                    Ok(jpeg) => jpeg,
                    Err(e) => {
                        tracing::error!(topic = %stream, error = %e, "Couldn't encode frame for cable");
                        break;
                    }
                };
                if subscription.send(Value::String(jpeg.to_base64())).await.is_err() {
                    break;
                }
            }
            Ok(())
        }))
    }

    async fn perform(&self, data: &str) -> Result<()> {
        let payload: Value = serde_json::from_str(data)?;
        self.broker.message(self.stream.clone(), Some(payload)).await
    }
}

/// Factory creating [`VideoStreamChannel`]s on `broker`
pub fn video_stream_channel_factory(broker: Broker) -> ChannelFactory {
    Arc::new(move |identifier: &str| {
        let channel: Arc<dyn Channel> = Arc::new(VideoStreamChannel::new(identifier, broker.clone())?);
        Ok(channel)
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::RgbImage;
    use serde_json::json;

    use super::*;
    use crate::broker::Context;
    use crate::frame::{ImageFrame, Metadata};

    fn video_identifier(name: &str) -> String {
        json!({"channel": VIDEO_STREAMS_CHANNEL, "name": name}).to_string()
    }

    fn gray_frame() -> ImageFrame {
        ImageFrame::new(RgbImage::from_pixel(4, 4, image::Rgb([90, 90, 90])), Metadata::new("test"))
            .with_quality(50)
    }

    #[test]
    fn test_video_channel_requires_name() {
        let broker = Broker::builder().build();
        let channel = VideoStreamChannel::new(&video_identifier("/a"), broker.clone()).unwrap();
        assert_eq!(channel.stream(), "/a");

        let missing = json!({"channel": VIDEO_STREAMS_CHANNEL}).to_string();
        assert!(matches!(
            VideoStreamChannel::new(&missing, broker),
            Err(Error::Identifier(_))
        ));
    }

    #[test]
    fn test_registry_unknown_channel() {
        let broker = Broker::builder().build();
        let registry = ChannelRegistry::new()
            .with_factory(VIDEO_STREAMS_CHANNEL, video_stream_channel_factory(broker));

        assert!(registry.create(&video_identifier("/a")).is_ok());
        let other = json!({"channel": "ChatChannel"}).to_string();
        assert!(matches!(registry.create(&other), Err(Error::Identifier(_))));
    }

    #[test]
    fn test_csrf_checker() {
        let checker = csrf_checker(Arc::new(|token: &str| -> Result<()> {
            if token == "good" {
                Ok(())
            } else {
                Err(Error::handler("token mismatch"))
            }
        }));

        let good = json!({"channel": "C", "csrfToken": "good"}).to_string();
        let bad = json!({"channel": "C", "csrfToken": "bad"}).to_string();
        let missing = json!({"channel": "C"}).to_string();
        assert!(checker(&good).is_ok());
        assert!(matches!(checker(&bad), Err(Error::Identifier(_))));
        assert!(matches!(checker(&missing), Err(Error::Identifier(_))));
    }

    #[test]
    fn test_registry_runs_checkers() {
        let broker = Broker::builder().build();
        let registry = ChannelRegistry::new()
            .with_factory(VIDEO_STREAMS_CHANNEL, video_stream_channel_factory(broker))
            .with_checker(Arc::new(|_: &str| -> Result<()> { Err(Error::handler("nope")) }));

        assert!(registry.create(&video_identifier("/a")).is_err());
    }

    #[tokio::test]
    async fn test_video_channel_streams_base64_jpeg() {
        let broker = Broker::builder()
            .on_pub("/gray", |ctx: Context| async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(5));
                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => return Ok(()),
                        _ = ticker.tick() => {
                            ctx.publish(gray_frame().into());
                        }
                    }
                }
            })
            .build();
        let shutdown = CancellationToken::new();
        let serving = broker.clone();
        let token = shutdown.clone();
        let server = tokio::spawn(async move { serving.serve(token).await });

        let identifier = video_identifier("/gray");
        let channel = VideoStreamChannel::new(&identifier, broker.clone()).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let subscription = CableSubscription::new(&identifier, tx, cancel.clone());

        let task = tokio::spawn(channel.subscribe(subscription).await.unwrap());
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.identifier.as_deref(), Some(identifier.as_str()));
        let data = message.message.unwrap();
        assert!(data.as_str().unwrap().starts_with("/9j/"));

        cancel.cancel();
        task.await.unwrap().unwrap();

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_identifier_rejected() {
        let broker = Broker::builder().build();
        let channel = VideoStreamChannel::new(&video_identifier("/a"), broker).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let subscription =
            CableSubscription::new(&video_identifier("/b"), tx, CancellationToken::new());
        assert!(channel.subscribe(subscription).await.is_err());
    }
}
