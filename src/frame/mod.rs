//! Frames flowing through the video pipeline
//!
//! A [`Frame`] is either a decoded RGB image ([`ImageFrame`]) or a
//! JPEG-encoded buffer ([`JpegFrame`]). Both carry optional [`Metadata`] and
//! an optional terminal error. Frames are never mutated: every transform
//! returns a new frame, and the pixel/byte buffers are reference counted so
//! one published frame can feed any number of subscriber pipelines.
//!
//! ```text
//!   JpegFrame ──as_image_frame()──► ImageFrame ──with_resize_to_height()──► ImageFrame
//!       ▲                                │
//!       └──────────as_jpeg_frame()───────┘  (quality from metadata settings)
//! ```

pub mod annotation;
pub mod draw;
pub mod metadata;

use std::io::Cursor;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};

use crate::error::{Error, Result};

pub use annotation::AnnotationMetadata;
pub use metadata::{Metadata, OpChain, Operation, Settings, SourceHeaders};

/// A unit of pipeline data
#[derive(Debug, Clone)]
pub enum Frame {
    /// Decoded image
    Image(ImageFrame),
    /// JPEG-encoded bytes
    Jpeg(JpegFrame),
}

impl Frame {
    /// A frame that only carries an error.
    ///
    /// Sources publish one of these when they fail so subscribers can react.
    pub fn from_error(err: Error) -> Self {
        Frame::Image(ImageFrame {
            image: Arc::new(RgbImage::new(0, 0)),
            meta: None,
            error: Some(Arc::new(err)),
        })
    }

    /// The terminal error attached to this frame, if any
    pub fn error(&self) -> Option<&Arc<Error>> {
        match self {
            Frame::Image(f) => f.error.as_ref(),
            Frame::Jpeg(f) => f.error.as_ref(),
        }
    }

    /// Metadata attached to this frame, if any
    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            Frame::Image(f) => f.meta.as_ref(),
            Frame::Jpeg(f) => f.meta.as_ref(),
        }
    }

    /// Decode if needed; identity for image frames.
    ///
    /// A frame carrying an error yields that error.
    pub fn as_image_frame(&self) -> Result<ImageFrame> {
        match self {
            Frame::Image(f) => {
                f.check()?;
                Ok(f.clone())
            }
            Frame::Jpeg(f) => f.as_image_frame(),
        }
    }

    /// Encode if needed; identity for JPEG frames.
    ///
    /// A frame carrying an error yields that error.
    pub fn as_jpeg_frame(&self) -> Result<JpegFrame> {
        match self {
            Frame::Image(f) => f.as_jpeg_frame(),
            Frame::Jpeg(f) => {
                f.check()?;
                Ok(f.clone())
            }
        }
    }
}

impl From<ImageFrame> for Frame {
    fn from(f: ImageFrame) -> Self {
        Frame::Image(f)
    }
}

impl From<JpegFrame> for Frame {
    fn from(f: JpegFrame) -> Self {
        Frame::Jpeg(f)
    }
}

fn stream_error(err: &Option<Arc<Error>>) -> Result<()> {
    match err {
        Some(e) => Err(Error::Stream(Arc::clone(e))),
        None => Ok(()),
    }
}

/// A decoded RGB image with metadata
#[derive(Debug, Clone)]
pub struct ImageFrame {
    image: Arc<RgbImage>,
    meta: Option<Metadata>,
    error: Option<Arc<Error>>,
}

impl ImageFrame {
    /// Create a frame from an image and its metadata
    pub fn new(image: RgbImage, meta: Metadata) -> Self {
        Self {
            image: Arc::new(image),
            meta: Some(meta),
            error: None,
        }
    }

    /// Create a frame without metadata
    pub fn bare(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
            meta: None,
            error: None,
        }
    }

    /// Black frame with a centred message, ready to encode at `quality`
    pub fn placeholder(width: u32, height: u32, message: &str, quality: i64) -> Self {
        let meta = Metadata::new(format!("render placeholder \"{message}\""))
            .with_settings(Settings::with_quality(quality));
        Self::new(draw::placeholder(width, height, message), meta)
    }

    /// The pixels
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// The metadata
    pub fn metadata(&self) -> Option<&Metadata> {
        self.meta.as_ref()
    }

    /// The terminal error
    pub fn error(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }

    fn check(&self) -> Result<()> {
        stream_error(&self.error)
    }

    fn derive(&self, image: RgbImage, op: String) -> Self {
        Self {
            image: Arc::new(image),
            meta: self.meta.as_ref().map(|m| m.with_op(op)),
            error: None,
        }
    }

    /// Copy of this frame that will encode at `quality`
    pub fn with_quality(&self, quality: i64) -> Self {
        let settings = Settings::with_quality(quality);
        let meta = match &self.meta {
            Some(m) => m.with_settings(settings),
            None => Metadata::new(Operation::nop()).with_settings(settings),
        };
        Self {
            image: Arc::clone(&self.image),
            meta: Some(meta),
            error: self.error.clone(),
        }
    }

    /// Resize to exactly `height` pixels, width scaled to keep the aspect
    /// ratio (rounded to the nearest pixel)
    pub fn with_resize_to_height(&self, height: u32) -> Result<Self> {
        self.check()?;
        let resized = draw::resize_to_height(&self.image, height)?;
        Ok(self.derive(resized, format!("resize to height {height}")))
    }

    /// Fill a `width` x `height` canvas with the color of the top-left pixel
    pub fn with_uniform_resize(&self, width: u32, height: u32) -> Result<Self> {
        self.check()?;
        if width == 0 || height == 0 || self.image.width() == 0 || self.image.height() == 0 {
            return Err(Error::InvalidDimensions { width, height });
        }
        let color = *self.image.get_pixel(0, 0);
        Ok(self.derive(
            draw::uniform(width, height, color),
            format!("resize to {width}x{height}"),
        ))
    }

    /// Pad the top by `lines` rows of text and draw `annotations` on an
    /// opaque bar
    pub fn with_annotation(&self, annotations: &str, lines: u32) -> Result<Self> {
        self.check()?;
        let mut output = draw::pad_for_annotation(&self.image, lines, 0);
        draw::annotate_top(&mut output, annotations, lines);
        Ok(self.derive(output, "annotate".to_string()))
    }

    /// JPEG-encode at the quality recorded in the metadata settings
    pub fn as_jpeg_frame(&self) -> Result<JpegFrame> {
        self.check()?;
        let meta = self.meta.as_ref().ok_or(Error::MissingMetadata)?;
        let quality = meta.settings.validated_quality()?;

        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, quality).encode_image(self.image.as_ref())?;

        Ok(JpegFrame {
            data: Bytes::from(buf),
            meta: Some(meta.with_op(format!("encode as JPEG q={quality}"))),
            error: None,
        })
    }
}

/// JPEG-encoded bytes with metadata
#[derive(Debug, Clone)]
pub struct JpegFrame {
    data: Bytes,
    meta: Option<Metadata>,
    error: Option<Arc<Error>>,
}

impl JpegFrame {
    /// Create a frame from already-encoded bytes
    pub fn new(data: Bytes, meta: Metadata) -> Self {
        Self {
            data,
            meta: Some(meta),
            error: None,
        }
    }

    /// The encoded bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The metadata
    pub fn metadata(&self) -> Option<&Metadata> {
        self.meta.as_ref()
    }

    /// The terminal error
    pub fn error(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }

    fn check(&self) -> Result<()> {
        stream_error(&self.error)
    }

    /// Decode into an RGB image frame
    pub fn as_image_frame(&self) -> Result<ImageFrame> {
        self.check()?;
        let decoded =
            image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg)?.into_rgb8();
        Ok(ImageFrame {
            image: Arc::new(decoded),
            meta: self.meta.as_ref().map(|m| m.with_op("decode JPEG")),
            error: None,
        })
    }

    /// Standard base64 of the encoded bytes
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// Read the image dimensions from the JPEG header without decoding pixels
    pub fn dimensions(&self) -> Result<(u32, u32)> {
        let reader = image::ImageReader::with_format(Cursor::new(&self.data), ImageFormat::Jpeg);
        Ok(reader.into_dimensions()?)
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
        })
    }

    fn source_frame(width: u32, height: u32) -> ImageFrame {
        ImageFrame::new(gradient(width, height), Metadata::new("generate gradient"))
            .with_quality(75)
    }

    #[test]
    fn test_jpeg_round_trip_keeps_dimensions() {
        let frame = source_frame(64, 48);
        let jpeg = frame.as_jpeg_frame().unwrap();
        assert_eq!(jpeg.dimensions().unwrap(), (64, 48));

        let decoded = jpeg.as_image_frame().unwrap();
        assert_eq!(decoded.image().dimensions(), (64, 48));

        let ops: Vec<String> = decoded
            .metadata()
            .unwrap()
            .operations
            .linearize()
            .iter()
            .map(|o| o.to_string())
            .collect();
        assert_eq!(
            ops,
            vec!["generate gradient", "encode as JPEG q=75", "decode JPEG"]
        );
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let frame = source_frame(32, 32);
        let a = frame.as_jpeg_frame().unwrap();
        let b = frame.as_jpeg_frame().unwrap();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_encode_requires_metadata_and_quality() {
        let bare = ImageFrame::bare(gradient(8, 8));
        assert!(matches!(bare.as_jpeg_frame(), Err(Error::MissingMetadata)));

        let unset = ImageFrame::new(gradient(8, 8), Metadata::new("generate"));
        assert!(matches!(unset.as_jpeg_frame(), Err(Error::InvalidQuality(0))));

        let too_high = unset.with_quality(101);
        assert!(matches!(too_high.as_jpeg_frame(), Err(Error::InvalidQuality(101))));
    }

    #[test]
    fn test_resize_to_height() {
        let frame = source_frame(100, 30);
        let resized = frame.with_resize_to_height(50).unwrap();
        assert_eq!(resized.image().dimensions(), (167, 50));
        assert_eq!(
            resized.metadata().unwrap().operations.last().map(Operation::as_str),
            Some("resize to height 50")
        );

        // Input untouched
        assert_eq!(frame.image().dimensions(), (100, 30));
        assert_eq!(frame.metadata().unwrap().operations.len(), 1);
    }

    #[test]
    fn test_annotation_pads_top() {
        let frame = source_frame(320, 240);
        let annotated = frame.with_annotation("[320x240]", 1).unwrap();
        assert_eq!(
            annotated.image().dimensions(),
            (320, 240 + draw::annotation_height(1))
        );
        assert_eq!(frame.image().dimensions(), (320, 240));
        // Settings survive the transform so the result can still be encoded
        assert!(annotated.as_jpeg_frame().is_ok());
    }

    #[test]
    fn test_error_frames_propagate() {
        let frame = Frame::from_error(Error::handler("upstream gone"));
        assert!(frame.error().is_some());
        assert!(matches!(frame.as_image_frame(), Err(Error::Stream(_))));
        assert!(matches!(frame.as_jpeg_frame(), Err(Error::Stream(_))));
    }

    #[test]
    fn test_frame_conversions() {
        let image: Frame = source_frame(16, 16).into();
        let jpeg: Frame = image.as_jpeg_frame().unwrap().into();

        // Identity on the already-encoded variant shares the buffer
        let again = jpeg.as_jpeg_frame().unwrap();
        if let Frame::Jpeg(original) = &jpeg {
            assert_eq!(original.data().as_ptr(), again.data().as_ptr());
        }
        assert_eq!(jpeg.as_image_frame().unwrap().image().dimensions(), (16, 16));
    }

    #[test]
    fn test_corrupt_jpeg_is_an_error() {
        let frame = JpegFrame::new(Bytes::from_static(b"not a jpeg"), Metadata::new("receive"));
        assert!(matches!(frame.as_image_frame(), Err(Error::Image(_))));
    }

    #[test]
    fn test_base64() {
        let frame = JpegFrame::new(Bytes::from_static(&[0xff, 0xd8, 0xff]), Metadata::new("x"));
        assert_eq!(frame.to_base64(), "/9j/");
    }

    #[test]
    fn test_placeholder_encodes() {
        let frame = ImageFrame::placeholder(320, 240, "loading stream...", 80);
        let jpeg = frame.as_jpeg_frame().unwrap();
        assert_eq!(jpeg.dimensions().unwrap(), (320, 240));
    }

    #[test]
    fn test_uniform_resize() {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(0, 0, Rgb([10, 20, 30]));
        let frame = ImageFrame::new(image, Metadata::new("generate")).with_quality(20);

        let filled = frame.with_uniform_resize(8, 6).unwrap();
        assert_eq!(filled.image().dimensions(), (8, 6));
        assert!(filled.image().pixels().all(|p| *p == Rgb([10, 20, 30])));
        let last = filled.metadata().unwrap().operations.last().unwrap().as_str().to_string();
        assert_eq!(last, "resize to 8x6");

        assert!(matches!(
            frame.with_uniform_resize(0, 6),
            Err(Error::InvalidDimensions { .. })
        ));
    }
}
