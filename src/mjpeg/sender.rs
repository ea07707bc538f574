//! MJPEG stream sender
//!
//! Writes frames as parts of a `multipart/x-mixed-replace` body and flushes
//! after every part so each frame reaches the client as soon as it is
//! written.

use chrono::Utc;
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::frame::Frame;

use super::JPEG_CONTENT_TYPE;

/// Random bytes in a generated boundary
const BOUNDARY_BYTES: usize = 30;

/// Generate a random multipart boundary
pub fn random_boundary() -> String {
    let mut rng = rand::thread_rng();
    (0..BOUNDARY_BYTES)
        .map(|_| format!("{:02x}", rng.gen::<u8>()))
        .collect()
}

/// Writes JPEG frames as multipart parts
pub struct MjpegSender<W> {
    writer: W,
    boundary: String,
    parts: u64,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> MjpegSender<W> {
    /// Start a stream with a random boundary
    pub fn new(writer: W) -> Self {
        Self::with_boundary(writer, random_boundary())
    }

    /// Start a stream with a specific boundary
    pub fn with_boundary(writer: W, boundary: impl Into<String>) -> Self {
        Self {
            writer,
            boundary: boundary.into(),
            parts: 0,
            closed: false,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the response's `Content-Type` header
    pub fn content_type(&self) -> String {
        content_type(&self.boundary)
    }

    /// Number of parts written so far
    pub fn parts_sent(&self) -> u64 {
        self.parts
    }

    /// Encode the frame if needed and write it as one part.
    ///
    /// A frame carrying an error is returned as that error, nothing is
    /// written.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let jpeg = frame.as_jpeg_frame()?;
        let timestamp = jpeg
            .metadata()
            .map(|meta| meta.received_at)
            .unwrap_or_else(Utc::now)
            .timestamp_millis();
        self.write_part(jpeg.data(), timestamp).await
    }

    /// Write already-encoded JPEG bytes as one part
    pub async fn send_jpeg(&mut self, data: &[u8]) -> Result<()> {
        self.write_part(data, Utc::now().timestamp_millis()).await
    }

    async fn write_part(&mut self, data: &[u8], timestamp: i64) -> Result<()> {
        let delimiter = if self.parts == 0 { "" } else { "\r\n" };
        let head = format!(
            "{delimiter}--{boundary}\r\nContent-Type: {JPEG_CONTENT_TYPE}\r\nContent-Length: {length}\r\nX-Timestamp: {timestamp}\r\n\r\n",
            boundary = self.boundary,
            length = data.len(),
        );

        self.writer.write_all(head.as_bytes()).await?;
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        self.parts += 1;
        Ok(())
    }

    /// Write the closing boundary. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let delimiter = if self.parts == 0 { "" } else { "\r\n" };
        let tail = format!("{delimiter}--{}--\r\n", self.boundary);
        self.writer.write_all(tail.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Give back the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// `multipart/x-mixed-replace` content type for `boundary`
pub fn content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={boundary}")
}

#[cfg(test)]
mod tests {
    use std::io;

    use bytes::Bytes;
    use image::RgbImage;

    use super::*;
    use crate::error::Error;
    use crate::frame::{ImageFrame, JpegFrame, Metadata};
    use crate::mjpeg::receiver::{parse_boundary, MjpegReceiver};

    #[test]
    fn test_random_boundary() {
        let a = random_boundary();
        let b = random_boundary();
        assert_eq!(a.len(), BOUNDARY_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_wire_format() {
        let mut sender = MjpegSender::with_boundary(Vec::new(), "b");
        sender.send_jpeg(b"one").await.unwrap();
        sender.send_jpeg(b"two").await.unwrap();
        sender.close().await.unwrap();
        sender.close().await.unwrap();

        let written = String::from_utf8(sender.into_inner()).unwrap();
        assert!(written.starts_with("--b\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\nX-Timestamp: "));
        assert!(written.contains("\r\n\r\none\r\n--b\r\n"));
        assert!(written.ends_with("\r\n\r\ntwo\r\n--b--\r\n"));
    }

    #[tokio::test]
    async fn test_sender_to_receiver() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut sender = MjpegSender::new(server);
        let boundary = parse_boundary(&sender.content_type()).unwrap();

        let writer = tokio::spawn(async move {
            let frame = ImageFrame::new(RgbImage::new(48, 32), Metadata::new("generate"))
                .with_quality(60);
            for _ in 0..3 {
                sender.send_frame(&frame.clone().into()).await.unwrap();
            }
            sender.close().await.unwrap();
            sender.parts_sent()
        });

        let mut receiver = MjpegReceiver::new(client, &boundary);
        let mut received = 0;
        while let Some(frame) = receiver.receive().await.unwrap() {
            assert_eq!(frame.dimensions().unwrap(), (48, 32));
            assert!(frame.metadata().unwrap().source_header("X-Timestamp").is_some());
            received += 1;
        }

        assert_eq!(received, 3);
        assert_eq!(writer.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_disconnected_client() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut sender = MjpegSender::new(server);
        let frame = JpegFrame::new(Bytes::from_static(b"\xff\xd8\xff\xd9"), Metadata::new("x"));
        let err = sender.send_frame(&frame.into()).await.unwrap_err();
        assert!(err.is_disconnect());
        assert!(crate::error::except_disconnect(Err(err)).is_ok());
    }

    #[tokio::test]
    async fn test_error_frame_is_not_written() {
        let mut sender = MjpegSender::with_boundary(Vec::new(), "b");
        let frame = Frame::from_error(Error::Io(io::ErrorKind::TimedOut.into()));

        assert!(matches!(sender.send_frame(&frame).await, Err(Error::Stream(_))));
        assert_eq!(sender.parts_sent(), 0);
        assert!(sender.into_inner().is_empty());
    }
}
