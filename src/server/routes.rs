//! HTTP routes
//!
//! Snapshot endpoints subscribe to a source topic, take one frame and
//! unsubscribe. Stream endpoints subscribe for as long as the client reads,
//! writing multipart JPEG parts from a task tracked by the server so that
//! shutdown can wait for every stream to close. Each stream has its own
//! request token, cancelled on shutdown or as soon as the response body is
//! dropped, which ends the subscription even while the source is quiet.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncWrite, DuplexStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::broker::{Broker, Subscription};
use crate::cable::{CableConnection, ChannelRegistry};
use crate::error::{except_disconnect, Error, Result};
use crate::frame::{AnnotationMetadata, Frame, ImageFrame, JpegFrame};
use crate::mjpeg::{MjpegSender, JPEG_CONTENT_TYPE};
use crate::server::config::ServerConfig;
use crate::sources::camera::parse_camera_id;
use crate::sources::{
    external_source_topic, failed_frame, loading_frame, CameraStore, ANIMATED_COLOR_SOURCE,
};
use crate::stats::FpsCounter;

/// Bytes buffered between a stream's writer task and its response body
pub const STREAM_BUFFER: usize = 64 * 1024;

const X_TIMESTAMP: HeaderName = HeaderName::from_static("x-timestamp");

type QueryParams = HashMap<String, String>;

/// State shared by every route
#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

struct StateInner {
    config: ServerConfig,
    broker: Broker,
    cameras: Arc<dyn CameraStore>,
    channels: Arc<ChannelRegistry>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    limit: Option<Arc<Semaphore>>,
    loading_jpeg: Bytes,
    failed_jpeg: Bytes,
}

impl AppState {
    /// Create route state.
    ///
    /// Streams and cable connections stop when `shutdown` is cancelled and
    /// are tracked by `tasks`.
    pub fn new(
        config: ServerConfig,
        broker: Broker,
        cameras: Arc<dyn CameraStore>,
        channels: Arc<ChannelRegistry>,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    ) -> Result<Self> {
        let limit = (config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(config.max_connections)));
        let loading_jpeg = loading_frame().as_jpeg_frame()?.data().clone();
        let failed_jpeg = failed_frame().as_jpeg_frame()?.data().clone();

        Ok(Self {
            inner: Arc::new(StateInner {
                config,
                broker,
                cameras,
                channels,
                shutdown,
                tasks,
                limit,
                loading_jpeg,
                failed_jpeg,
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Take a connection slot, if connections are limited
    fn admit(&self) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(limit) = &self.inner.limit else {
            return Ok(None);
        };
        match Arc::clone(limit).try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => {
                tracing::warn!(limit = self.inner.config.max_connections, "Request rejected: limit reached");
                Err(Error::Overloaded(self.inner.config.max_connections))
            }
        }
    }

    /// Token for one streaming request, cancelled on shutdown or when the
    /// response body is dropped
    fn request_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Subscribe to `topic` just long enough to take one frame
    async fn first_frame(&self, topic: String) -> Result<Frame> {
        let mut frames = self.inner.broker.subscribe(topic).await?;
        let frame = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(Error::BrokerClosed),
            frame = frames.recv() => frame,
        };
        frame.ok_or_else(|| {
            Error::Stream(Arc::new(Error::handler("source ended before its first frame")))
        })
    }

    /// Respond with a multipart stream written by `produce`.
    ///
    /// `request` is cancelled once the client stops reading the body.
    fn mjpeg_response<F, Fut>(
        &self,
        permit: Option<OwnedSemaphorePermit>,
        stream: String,
        request: CancellationToken,
        produce: F,
    ) -> Response
    where
        F: FnOnce(MjpegSender<DuplexStream>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (writer, reader) = tokio::io::duplex(STREAM_BUFFER);
        let sender = MjpegSender::new(writer);
        let content_type = sender.content_type();
        let task = produce(sender);

        self.inner.tasks.spawn(async move {
            let _permit = permit;
            tracing::debug!(stream = %stream, "MJPEG stream started");
            if let Err(e) = except_disconnect(task.await) {
                tracing::error!(stream = %stream, error = %e, "MJPEG stream failed");
            }
            tracing::debug!(stream = %stream, "MJPEG stream ended");
        });

        (
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-store".to_string()),
            ],
            Body::from_stream(StreamBody {
                chunks: ReaderStream::new(reader),
                _cancel: request.drop_guard(),
            }),
        )
            .into_response()
    }

    fn placeholder_not_found(&self) -> Response {
        (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, JPEG_CONTENT_TYPE)],
            self.inner.failed_jpeg.clone(),
        )
            .into_response()
    }
}

/// Response body that cancels its request when dropped
struct StreamBody {
    chunks: ReaderStream<DuplexStream>,
    _cancel: DropGuard,
}

impl Stream for StreamBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.chunks).poll_next(cx)
    }
}

/// Router serving the video endpoints and the cable
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/video-streams/animated-color/frame.jpeg", get(animated_frame))
        .route("/video-streams/animated-color/stream.mjpeg", get(animated_stream))
        .route("/video-streams/external-stream/frame.jpeg", get(external_frame))
        .route("/video-streams/external-stream/stream.mjpeg", get(external_stream))
        .route("/instruments/cameras/:camera_id/frame.jpeg", get(camera_frame))
        .route("/instruments/cameras/:camera_id/stream.mjpeg", get(camera_stream))
        .route("/video-cable", get(video_cable))
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidParam(_)
            | Error::InvalidQuality(_)
            | Error::InvalidDimensions { .. }
            | Error::Identifier(_) => StatusCode::BAD_REQUEST,
            Error::SubscriptionRejected { .. } => StatusCode::FORBIDDEN,
            Error::NoRoute { .. } => StatusCode::NOT_FOUND,
            Error::Stream(_) | Error::Upstream { .. } | Error::UpstreamStatus { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Error::BrokerClosed | Error::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}

/// Parse an optional query parameter, falling back to `default` when absent
pub fn int_param<T: FromStr>(query: &QueryParams, name: &str, default: T) -> Result<T> {
    match query.get(name).map(String::as_str).filter(|raw| !raw.is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::InvalidParam(format!("invalid {name} parameter {raw}"))),
    }
}

/// Whether a boolean query parameter is set to `true`
pub fn flag_param(query: &QueryParams, name: &str) -> bool {
    query.get(name).is_some_and(|value| value == "true")
}

/// Parse a frame dimension, rejecting zero and values above `max`
fn dimension_param(query: &QueryParams, name: &str, default: u32, max: u32) -> Result<u32> {
    let value = int_param(query, name, default)?;
    if value == 0 || value > max {
        return Err(Error::InvalidParam(format!(
            "{name} must be between 1 and {max}, got {value}"
        )));
    }
    Ok(value)
}

fn url_param(query: &QueryParams) -> Result<&str> {
    query
        .get("url")
        .map(String::as_str)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            Error::InvalidParam("missing query param 'url' to specify the external source".into())
        })
}

fn jpeg_response(jpeg: &JpegFrame) -> Response {
    let timestamp = jpeg
        .metadata()
        .map(|meta| meta.received_at.timestamp_millis())
        .unwrap_or_default();
    (
        [
            (header::CONTENT_TYPE, JPEG_CONTENT_TYPE.to_string()),
            (X_TIMESTAMP, timestamp.to_string()),
        ],
        jpeg.data().clone(),
    )
        .into_response()
}

/// Annotates frames with their size, time, quality and the stream's rate
fn annotator(quality: i64, window: Duration) -> impl FnMut(ImageFrame) -> Result<ImageFrame> + Send {
    let mut fps = FpsCounter::new(window);
    move |frame: ImageFrame| -> Result<ImageFrame> {
        let now = Instant::now();
        fps.tick(now);
        let frame = frame.with_quality(quality);
        let annotation =
            AnnotationMetadata::with_rate(fps.count(now), fps.period()).with_frame_data(&frame);
        frame.with_annotation(&annotation.to_string(), 1)
    }
}

/// Write transformed frames until the source ends or the request is cancelled
async fn pump<W, F>(
    sender: &mut MjpegSender<W>,
    frames: &mut Subscription,
    request: &CancellationToken,
    mut transform: F,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    F: FnMut(Frame) -> Result<Frame>,
{
    loop {
        let frame = tokio::select! {
            _ = request.cancelled() => return Ok(()),
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let output = transform(frame)?;
        sender.send_frame(&output).await?;
    }
}

/// Pass-through for JPEG sources, re-encoding only when annotating
fn source_transform(
    annotated: bool,
    quality: i64,
    window: Duration,
) -> impl FnMut(Frame) -> Result<Frame> + Send {
    let mut annotate = annotated.then(|| annotator(quality, window));
    move |frame: Frame| -> Result<Frame> {
        match annotate.as_mut() {
            Some(annotate) => Ok(annotate(frame.as_image_frame()?)?.into()),
            None => Ok(frame),
        }
    }
}

// Animated color

async fn animated_frame(
    State(state): State<AppState>,
    Query(query): Query<QueryParams>,
) -> Result<Response> {
    let config = state.config();
    let max = config.max_frame_dimension;
    let width = dimension_param(&query, "width", config.synthetic_width, max)?;
    let height = dimension_param(&query, "height", config.synthetic_height, max)?;
    let quality = int_param(&query, "quality", config.synthetic_quality)?;
    let _permit = state.admit()?;

    let frame = state.first_frame(ANIMATED_COLOR_SOURCE.to_string()).await?;
    let jpeg = frame
        .as_image_frame()?
        .with_uniform_resize(width, height)?
        .with_quality(quality)
        .as_jpeg_frame()?;
    Ok(jpeg_response(&jpeg))
}

async fn animated_stream(
    State(state): State<AppState>,
    Query(query): Query<QueryParams>,
) -> Result<Response> {
    let config = state.config();
    let max = config.max_frame_dimension;
    let width = dimension_param(&query, "width", config.synthetic_width, max)?;
    let height = dimension_param(&query, "height", config.synthetic_height, max)?;
    let quality = int_param(&query, "quality", config.synthetic_quality)?;
    let annotated = flag_param(&query, "annotated");
    let window = config.fps_window;
    let permit = state.admit()?;

    let request = state.request_token();
    let mut frames = state.broker().subscribe_with(ANIMATED_COLOR_SOURCE, &request).await?;
    let mut annotate = annotated.then(|| annotator(quality, window));
    let transform = move |frame: Frame| -> Result<Frame> {
        let image = frame
            .as_image_frame()?
            .with_uniform_resize(width, height)?
            .with_quality(quality);
        let image = match annotate.as_mut() {
            Some(annotate) => annotate(image)?,
            None => image,
        };
        Ok(image.into())
    };

    let stream = ANIMATED_COLOR_SOURCE.to_string();
    Ok(state.mjpeg_response(permit, stream, request.clone(), move |mut sender| async move {
        let result = pump(&mut sender, &mut frames, &request, transform).await;
        result.and(sender.close().await)
    }))
}

// External streams

async fn external_frame(
    State(state): State<AppState>,
    Query(query): Query<QueryParams>,
) -> Result<Response> {
    let config = state.config();
    let height = dimension_param(
        &query,
        "height",
        config.external_frame_height,
        config.max_frame_dimension,
    )?;
    let quality = int_param(&query, "quality", config.snapshot_quality)?;
    let topic = external_source_topic(url_param(&query)?);
    let _permit = state.admit()?;

    let frame = state.first_frame(topic).await?;
    let jpeg = frame
        .as_image_frame()?
        .with_resize_to_height(height)?
        .with_quality(quality)
        .as_jpeg_frame()?;
    Ok(jpeg_response(&jpeg))
}

async fn external_stream(
    State(state): State<AppState>,
    Query(query): Query<QueryParams>,
) -> Result<Response> {
    let config = state.config();
    let annotated = flag_param(&query, "annotated");
    let transform = source_transform(annotated, config.stream_quality, config.fps_window);
    let topic = external_source_topic(url_param(&query)?);
    let permit = state.admit()?;

    let request = state.request_token();
    let mut frames = state.broker().subscribe_with(topic.clone(), &request).await?;
    Ok(state.mjpeg_response(permit, topic, request.clone(), move |mut sender| async move {
        let result = pump(&mut sender, &mut frames, &request, transform).await;
        result.and(sender.close().await)
    }))
}

// Cameras

async fn camera_frame(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(query): Query<QueryParams>,
) -> Result<Response> {
    let id = parse_camera_id(&camera_id)?;
    let config = state.config();
    let height = dimension_param(
        &query,
        "height",
        config.default_frame_height,
        config.max_frame_dimension,
    )?;
    let quality = int_param(&query, "quality", config.snapshot_quality)?;
    let _permit = state.admit()?;

    let Some(camera) = state.inner.cameras.get_camera(id).await? else {
        return Ok(state.placeholder_not_found());
    };
    let frame = state
        .first_frame(external_source_topic(&camera.url))
        .await
        .and_then(|frame| frame.as_image_frame());
    let image = match frame {
        Ok(image) => image,
        Err(e) => {
            tracing::debug!(camera = id, error = %e, "Camera frame unavailable");
            return Ok(state.placeholder_not_found());
        }
    };

    let jpeg = image
        .with_resize_to_height(height)?
        .with_quality(quality)
        .as_jpeg_frame()?;
    Ok(jpeg_response(&jpeg))
}

async fn camera_stream(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(query): Query<QueryParams>,
) -> Result<Response> {
    let id = parse_camera_id(&camera_id)?;
    let config = state.config();
    let annotated = flag_param(&query, "annotated");
    let quality = int_param(&query, "quality", config.stream_quality)?;
    let transform = source_transform(annotated, quality, config.fps_window);
    let permit = state.admit()?;

    let Some(camera) = state.inner.cameras.get_camera(id).await? else {
        return Ok((StatusCode::NOT_FOUND, format!("camera {id} not found")).into_response());
    };

    let request = state.request_token();
    let mut frames = state
        .broker()
        .subscribe_with(external_source_topic(&camera.url), &request)
        .await?;
    let loading = state.inner.loading_jpeg.clone();
    let failed = state.inner.failed_jpeg.clone();
    let stream = format!("camera {id}");
    Ok(state.mjpeg_response(permit, stream, request.clone(), move |mut sender| async move {
        sender.send_jpeg(&loading).await?;
        let result = pump(&mut sender, &mut frames, &request, transform).await;
        if matches!(&result, Err(e) if !e.is_disconnect()) {
            sender.send_jpeg(&failed).await?;
        }
        result.and(sender.close().await)
    }))
}

// Cable

async fn video_cable(State(state): State<AppState>, ws: WebSocketUpgrade) -> Result<Response> {
    let permit = state.admit()?;
    let config = state.config();
    let connection = CableConnection::new(
        Arc::clone(&state.inner.channels),
        config.cable_ping_interval,
        &state.inner.shutdown,
    );
    let tasks = state.inner.tasks.clone();

    Ok(ws
        .max_message_size(config.ws_max_message_size)
        .on_upgrade(move |socket| {
            tasks.track_future(async move {
                let _permit = permit;
                tracing::debug!("Cable connected");
                if let Err(e) = except_disconnect(connection.serve_websocket(socket).await) {
                    tracing::error!(error = %e, "Cable connection failed");
                }
                tracing::debug!("Cable disconnected");
            })
        }))
}
