//! Video server listener
//!
//! Binds the HTTP listener and runs it next to the broker event loop until
//! shutdown.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::Broker;
use crate::cable::{
    csrf_checker, video_stream_channel_factory, ChannelRegistry, TokenChecker,
    VIDEO_STREAMS_CHANNEL,
};
use crate::error::Result;
use crate::mjpeg::upstream_client;
use crate::server::config::ServerConfig;
use crate::server::routes::{self, AppState};
use crate::sources::{
    animated_color_source, camera_stream_source, external_source_with, CameraStore,
    ANIMATED_COLOR_SOURCE, CAMERA_STREAM, EXTERNAL_SOURCE,
};

/// Broker with the built-in frame sources registered
pub fn build_broker(
    config: &ServerConfig,
    client: reqwest::Client,
    cameras: Arc<dyn CameraStore>,
) -> Broker {
    Broker::builder()
        .on_pub(ANIMATED_COLOR_SOURCE, animated_color_source(config.source_tick))
        .on_pub(
            EXTERNAL_SOURCE,
            external_source_with(client, config.upstream_read_buffer, config.max_part_size),
        )
        .on_pub(CAMERA_STREAM, camera_stream_source(cameras))
        .build()
}

/// Video streaming server
pub struct VideoServer {
    config: ServerConfig,
    broker: Broker,
    cameras: Arc<dyn CameraStore>,
    channels: ChannelRegistry,
    token: CancellationToken,
    tasks: TaskTracker,
}

impl VideoServer {
    /// Create a server looking cameras up in `cameras`
    pub fn new(config: ServerConfig, cameras: Arc<dyn CameraStore>) -> Result<Self> {
        config.validate()?;
        let client = upstream_client(config.upstream_connect_timeout)?;
        let broker = build_broker(&config, client, Arc::clone(&cameras));
        let channels = ChannelRegistry::new().with_factory(
            VIDEO_STREAMS_CHANNEL,
            video_stream_channel_factory(broker.clone()),
        );

        Ok(Self {
            config,
            broker,
            cameras,
            channels,
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Require cable identifiers to carry a CSRF token accepted by `checker`
    pub fn with_token_checker(mut self, checker: Arc<dyn TokenChecker>) -> Self {
        self.channels = self.channels.with_checker(csrf_checker(checker));
        self
    }

    /// The server's broker
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// HTTP routes bound to this server's broker
    pub fn router(&self) -> Result<Router> {
        let state = AppState::new(
            self.config.clone(),
            self.broker.clone(),
            Arc::clone(&self.cameras),
            Arc::new(self.channels.clone()),
            self.token.clone(),
            self.tasks.clone(),
        )?;
        Ok(routes::router(state))
    }

    /// Run the server until its shutdown token is cancelled
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "Video server listening");
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// When `shutdown` resolves, open streams and cable connections are
    /// closed, the broker is drained and in-flight requests finish before
    /// this returns.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router()?;

        let token = self.token.clone();
        let signal = async move {
            tokio::select! {
                _ = shutdown => tracing::info!("Shutdown signal received"),
                _ = token.cancelled() => {}
            }
            token.cancel();
        };
        let http = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .into_future();

        let broker = async {
            let result = self.broker.serve(self.token.clone()).await;
            self.token.cancel();
            result
        };

        let (http, broker) = tokio::join!(http, broker);

        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Video server stopped");

        http?;
        broker
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
