//! Frame sources
//!
//! PUB handlers that produce frames into broker topics:
//!
//! - [`animated`]: a synthetic color animation with no upstream dependency
//! - [`external`]: an upstream MJPEG stream, proxied by URL
//! - [`camera`]: a stored camera's stream, republished as JPEG frames

pub mod animated;
pub mod camera;
pub mod external;

use crate::frame::ImageFrame;

pub use animated::{animated_color_source, AnimatedColor};
pub use camera::{camera_stream_source, Camera, CameraId, CameraStore, MemoryCameraStore};
pub use external::{external_source, external_source_topic, external_source_with};

/// Topic of the synthetic animated color source
pub const ANIMATED_COLOR_SOURCE: &str = "/video-streams/animated-color/source.mjpeg";

/// Topic pattern of proxied external MJPEG sources (query `url=`)
pub const EXTERNAL_SOURCE: &str = "/video-streams/external-stream/source.mjpeg";

/// Topic pattern of camera streams republished as JPEG
pub const CAMERA_STREAM: &str = "/instruments/cameras/:camera_id/stream.mjpeg";

/// Placeholder frame size
pub const PLACEHOLDER_WIDTH: u32 = 320;
pub const PLACEHOLDER_HEIGHT: u32 = 240;

/// JPEG quality of placeholder frames
pub const PLACEHOLDER_QUALITY: i64 = 80;

/// Frame shown while a stream is starting
pub fn loading_frame() -> ImageFrame {
    ImageFrame::placeholder(
        PLACEHOLDER_WIDTH,
        PLACEHOLDER_HEIGHT,
        "loading stream...",
        PLACEHOLDER_QUALITY,
    )
}

/// Frame shown when a stream's source has failed
pub fn failed_frame() -> ImageFrame {
    ImageFrame::placeholder(
        PLACEHOLDER_WIDTH,
        PLACEHOLDER_HEIGHT,
        "stream failed",
        PLACEHOLDER_QUALITY,
    )
}
