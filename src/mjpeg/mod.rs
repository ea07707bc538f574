//! MJPEG over HTTP
//!
//! Transport codecs for `multipart/x-mixed-replace` streams of JPEG images.
//! [`MjpegReceiver`] turns any `AsyncRead` (typically an upstream HTTP
//! response body) into [`JpegFrame`](crate::frame::JpegFrame)s, and
//! [`MjpegSender`] writes frames to any `AsyncWrite`.

pub mod receiver;
pub mod sender;

pub use receiver::{parse_boundary, upstream_client, MjpegReceiver, UpstreamReader};
pub use sender::{content_type, random_boundary, MjpegSender};

/// Content type of every part
pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Default limit on one part's body
pub const DEFAULT_MAX_PART_SIZE: usize = 16 * 1024 * 1024;

/// Canonical MIME header form: `x-timestamp` becomes `X-Timestamp`
pub fn canonical_header_key(key: &str) -> String {
    let mut upper = true;
    key.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_header_key() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("X-TIMESTAMP"), "X-Timestamp");
        assert_eq!(canonical_header_key("etag"), "Etag");
    }
}
