//! MJPEG stream receiver
//!
//! Parses a `multipart/x-mixed-replace` body into JPEG frames, one part at a
//! time:
//!
//! ```text
//! [preamble] --BOUNDARY\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: 1234\r\n        (optional)
//! \r\n
//! <jpeg bytes>\r\n--BOUNDARY\r\n
//! ...
//! <jpeg bytes>\r\n--BOUNDARY--
//! ```
//!
//! Parts with a `Content-Length` are read by length; others are delimited
//! by scanning for the next boundary.

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use crate::error::{Error, Result};
use crate::frame::{JpegFrame, Metadata, SourceHeaders};

use super::{canonical_header_key, DEFAULT_MAX_PART_SIZE, JPEG_CONTENT_TYPE};

/// Root operation of every received frame
pub const RECEIVE_OP: &str = "receive MJPEG over HTTP";

/// Default capacity of the receive buffer
pub const DEFAULT_READ_BUFFER: usize = 1024 * 1024;

/// Longest accepted header block of one part
const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Reader over an upstream HTTP response body
pub type UpstreamReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Extract the boundary from a multipart `Content-Type` value
pub fn parse_boundary(content_type: &str) -> Result<String> {
    let mut params = content_type.split(';');
    let media_type = params.next().unwrap_or("").trim().to_ascii_lowercase();
    if !media_type.starts_with("multipart/") {
        return Err(Error::UnexpectedStreamType(media_type));
    }

    params
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
        .ok_or_else(|| Error::Multipart("missing boundary parameter".into()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Before the first boundary line
    Preamble,
    /// Positioned at the start of a part's headers
    Headers,
    /// Final boundary seen or input exhausted
    Done,
}

/// Reads JPEG frames from a multipart stream
pub struct MjpegReceiver<R> {
    reader: R,
    buf: BytesMut,
    /// `--BOUNDARY`
    dash_boundary: Vec<u8>,
    /// `\r\n--BOUNDARY`
    delimiter: Vec<u8>,
    max_part_size: usize,
    state: State,
}

impl<R: AsyncRead + Unpin> MjpegReceiver<R> {
    /// Create a receiver reading parts separated by `boundary`
    pub fn new(reader: R, boundary: &str) -> Self {
        Self::with_capacity(reader, boundary, DEFAULT_READ_BUFFER)
    }

    /// Create a receiver with a specific read buffer capacity
    pub fn with_capacity(reader: R, boundary: &str, capacity: usize) -> Self {
        let dash_boundary = format!("--{boundary}").into_bytes();
        let mut delimiter = b"\r\n".to_vec();
        delimiter.extend_from_slice(&dash_boundary);

        Self {
            reader,
            buf: BytesMut::with_capacity(capacity),
            dash_boundary,
            delimiter,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            state: State::Preamble,
        }
    }

    /// Limit the size of one part's body
    pub fn max_part_size(mut self, limit: usize) -> Self {
        self.max_part_size = limit;
        self
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` at the end of the stream. A part whose
    /// `Content-Type` is not `image/jpeg` is an error.
    pub async fn receive(&mut self) -> Result<Option<JpegFrame>> {
        if self.state == State::Preamble && !self.skip_preamble().await? {
            self.state = State::Done;
        }
        if self.state == State::Done {
            return Ok(None);
        }

        let Some(mut headers) = self.read_headers().await? else {
            self.state = State::Done;
            return Ok(None);
        };

        let content_type = headers
            .get("Content-Type")
            .and_then(|values| values.first())
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        if content_type != JPEG_CONTENT_TYPE {
            return Err(Error::UnexpectedPartType(content_type));
        }

        let content_length = headers
            .get("Content-Length")
            .and_then(|values| values.first())
            .and_then(|value| value.trim().parse::<usize>().ok());
        let data = self.read_body(content_length).await?;
        self.finish_boundary_line().await?;

        headers.remove("Content-Type");
        let meta = Metadata::new(RECEIVE_OP).with_source_headers(headers);
        Ok(Some(JpegFrame::new(data, meta)))
    }

    /// Read more input. Returns false at end of input.
    async fn fill(&mut self) -> Result<bool> {
        Ok(self.reader.read_buf(&mut self.buf).await? > 0)
    }

    fn unexpected_eof(context: &str) -> Error {
        Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream ended {context}"),
        ))
    }

    /// Discard everything up to and including the first boundary line.
    /// Returns false if the input ends first.
    async fn skip_preamble(&mut self) -> Result<bool> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = find(&self.buf[scanned..], &self.dash_boundary) {
                self.buf.advance(scanned + pos + self.dash_boundary.len());
                self.state = State::Headers;
                self.finish_boundary_line().await?;
                return Ok(self.state == State::Headers);
            }
            // Keep a tail that could hold the start of a split boundary
            scanned = self.buf.len().saturating_sub(self.dash_boundary.len());
            if scanned > MAX_HEADER_SIZE {
                return Err(Error::Multipart("no boundary found in stream preamble".into()));
            }
            if !self.fill().await? {
                return Ok(false);
            }
        }
    }

    /// Consume the remainder of a boundary line, right after `--BOUNDARY`.
    ///
    /// A trailing `--` marks the final boundary.
    async fn finish_boundary_line(&mut self) -> Result<()> {
        loop {
            if self.buf.len() >= 2 && &self.buf[..2] == b"--" {
                self.buf.clear();
                self.state = State::Done;
                return Ok(());
            }
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                self.buf.advance(pos + 1);
                return Ok(());
            }
            if self.buf.len() > MAX_HEADER_SIZE {
                return Err(Error::Multipart("boundary line too long".into()));
            }
            if !self.fill().await? {
                // A stream cut right after a boundary has no more parts
                self.buf.clear();
                self.state = State::Done;
                return Ok(());
            }
        }
    }

    /// Parse a part's header block. Returns `None` if the input ended
    /// cleanly before any header byte.
    async fn read_headers(&mut self) -> Result<Option<SourceHeaders>> {
        let mut headers = SourceHeaders::new();
        let mut seen_any = false;
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_HEADER_SIZE {
                    return Err(Error::Multipart("part header block too large".into()));
                }
                if !self.fill().await? {
                    if !seen_any && self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(Self::unexpected_eof("inside part headers"));
                }
                continue;
            };

            let line = self.buf.split_to(pos + 1);
            seen_any = true;
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                return Ok(Some(headers));
            }

            let Some((key, value)) = line.split_once(':') else {
                return Err(Error::Multipart(format!("malformed part header {line:?}")));
            };
            headers
                .entry(canonical_header_key(key.trim()))
                .or_default()
                .push(value.trim().to_string());
        }
    }

    /// Read a part body, ending just after the following `\r\n--BOUNDARY`
    async fn read_body(&mut self, content_length: Option<usize>) -> Result<Bytes> {
        if let Some(length) = content_length {
            if length > self.max_part_size {
                return Err(Error::PartTooLarge {
                    size: length,
                    limit: self.max_part_size,
                });
            }
            while self.buf.len() < length {
                if !self.fill().await? {
                    return Err(Self::unexpected_eof("inside part body"));
                }
            }
            let data = self.buf.split_to(length).freeze();
            self.skip_delimiter().await?;
            return Ok(data);
        }

        let mut scanned = 0;
        loop {
            if let Some(pos) = find(&self.buf[scanned..], &self.delimiter) {
                let end = scanned + pos;
                if end > self.max_part_size {
                    return Err(Error::PartTooLarge {
                        size: end,
                        limit: self.max_part_size,
                    });
                }
                let data = self.buf.split_to(end).freeze();
                self.buf.advance(self.delimiter.len());
                return Ok(data);
            }
            scanned = self.buf.len().saturating_sub(self.delimiter.len());
            if scanned > self.max_part_size {
                return Err(Error::PartTooLarge {
                    size: scanned,
                    limit: self.max_part_size,
                });
            }
            if !self.fill().await? {
                return Err(Self::unexpected_eof("inside part body"));
            }
        }
    }

    /// Skip to just past the next `\r\n--BOUNDARY` after a length-delimited body
    async fn skip_delimiter(&mut self) -> Result<()> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = find(&self.buf[scanned..], &self.delimiter) {
                self.buf.advance(scanned + pos + self.delimiter.len());
                return Ok(());
            }
            scanned = self.buf.len().saturating_sub(self.delimiter.len());
            if scanned > MAX_HEADER_SIZE {
                return Err(Error::Multipart("missing boundary after part body".into()));
            }
            if !self.fill().await? {
                return Err(Self::unexpected_eof("before part boundary"));
            }
        }
    }
}

impl MjpegReceiver<UpstreamReader> {
    /// Open an MJPEG stream over HTTP.
    ///
    /// Fails on transport errors, non-200 responses and non-multipart
    /// content types. Dropping the receiver closes the connection.
    pub async fn connect(client: &reqwest::Client, url: &str) -> Result<Self> {
        Self::connect_with_capacity(client, url, DEFAULT_READ_BUFFER).await
    }

    /// Like [`MjpegReceiver::connect`], buffering up to `capacity` bytes of
    /// the response
    pub async fn connect_with_capacity(
        client: &reqwest::Client,
        url: &str,
        capacity: usize,
    ) -> Result<Self> {
        let response = client.get(url).send().await.map_err(|source| Error::Upstream {
            url: url.to_string(),
            source,
        })?;

        if response.status() != StatusCode::OK {
            return Err(Error::UpstreamStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let boundary = parse_boundary(content_type)?;

        tracing::debug!(url = %url, boundary = %boundary, "Opened MJPEG stream");

        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .boxed();
        Ok(Self::with_capacity(StreamReader::new(body), &boundary, capacity))
    }
}

/// Build the HTTP client used for upstream MJPEG sources
pub fn upstream_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|source| Error::Upstream {
            url: String::new(),
            source,
        })
}
