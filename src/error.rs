//! Error types
//!
//! A single error enum shared by the frame pipeline, the MJPEG codec, the
//! broker and the HTTP/websocket bridges.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all vidstream operations
#[derive(Debug, Error)]
pub enum Error {
    /// JPEG quality outside of [1, 100]
    #[error("invalid jpeg quality {0}")]
    InvalidQuality(i64),

    /// Encoding was requested on a frame without metadata
    #[error("unspecified jpeg quality due to missing metadata")]
    MissingMetadata,

    /// Image decode or encode failure
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    /// Invalid image dimensions requested by a transform
    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// A multipart part declared something other than image/jpeg
    #[error("unexpected stream part content type {0}")]
    UnexpectedPartType(String),

    /// The stream itself is not multipart, or has no boundary
    #[error("unexpected stream content type {0}")]
    UnexpectedStreamType(String),

    /// Malformed multipart framing
    #[error("malformed multipart stream: {0}")]
    Multipart(String),

    /// A single part exceeded the configured size limit
    #[error("stream part of {size} bytes exceeds limit of {limit} bytes")]
    PartTooLarge { size: usize, limit: usize },

    /// Upstream HTTP request failed
    #[error("couldn't open response from {url}: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Upstream answered with a non-200 status
    #[error("received http {status} from {url}")]
    UpstreamStatus { status: u16, url: String },

    /// Topic query parameter problems
    #[error("invalid topic parameter: {0}")]
    InvalidParam(String),

    /// No route matched a method that requires one
    #[error("no {method} route matches topic {topic}")]
    NoRoute { method: &'static str, topic: String },

    /// A SUB middleware or handler rejected the subscription
    #[error("subscription to {topic} rejected: {reason}")]
    SubscriptionRejected { topic: String, reason: String },

    /// The broker's event loop is gone
    #[error("broker is not serving")]
    BrokerClosed,

    /// `Broker::serve` was called more than once
    #[error("broker is already serving")]
    AlreadyServing,

    /// The server's connection limit is reached
    #[error("connection limit of {0} reached")]
    Overloaded(usize),

    /// Action Cable identifier could not be parsed or failed a check
    #[error("invalid channel identifier: {0}")]
    Identifier(String),

    /// Error attached to a frame by its source
    #[error("stream error: {0}")]
    Stream(Arc<Error>),

    /// Free-form handler error
    #[error("{0}")]
    Handler(String),

    /// JSON encoding/decoding failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),

    /// Configuration error
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a free-form handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Error::Handler(msg.into())
    }

    /// Whether this error means the peer went away.
    ///
    /// Broken pipes, resets and premature EOFs are the normal way an HTTP or
    /// websocket stream ends, so callers treat them as termination rather
    /// than failure. A source failure carried in a frame never counts, even
    /// when the upstream itself was reset.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => is_disconnect_kind(e.kind()),
            Error::Stream(_) => false,
            Error::WebSocket(_) => true,
            _ => false,
        }
    }
}

fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

/// Swallow disconnect-class errors, keeping every other error.
pub fn except_disconnect(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_disconnect() => {
            tracing::debug!(error = %e, "Peer disconnected");
            Ok(())
        }
        other => other,
    }
}
