//! Telemetry text drawn onto annotated frames

use std::fmt;

use chrono::{DateTime, Utc};

use super::ImageFrame;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f UTC";

/// Values shown in an annotation bar
///
/// Renders as `[WxH] [timestamp] [fps] [quality]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationMetadata {
    pub width: u32,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
    pub jpeg_quality: i64,
    /// Frames counted over `fps_period` seconds
    pub fps_count: u64,
    pub fps_period: f32,
}

impl AnnotationMetadata {
    /// Annotation carrying only the frame rate; frame fields are filled by
    /// [`AnnotationMetadata::with_frame_data`]
    pub fn with_rate(fps_count: u64, fps_period: f32) -> Self {
        Self {
            width: 0,
            height: 0,
            timestamp: DateTime::<Utc>::default(),
            jpeg_quality: 0,
            fps_count,
            fps_period,
        }
    }

    /// Copy dimensions, timestamp and quality from a frame
    pub fn with_frame_data(mut self, frame: &ImageFrame) -> Self {
        self.width = frame.image().width();
        self.height = frame.image().height();
        if let Some(meta) = frame.metadata() {
            self.timestamp = meta.received_at;
            self.jpeg_quality = meta.settings.jpeg_quality;
        }
        self
    }

    /// Frames per second over the counting period
    pub fn fps(&self) -> f32 {
        if self.fps_period > 0.0 {
            self.fps_count as f32 / self.fps_period
        } else {
            0.0
        }
    }
}

impl fmt::Display for AnnotationMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}x{}] [{}] [{:.1} fps] [q={:3}]",
            self.width,
            self.height,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.fps(),
            self.jpeg_quality,
        )
    }
}
