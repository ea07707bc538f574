//! External MJPEG source
//!
//! Proxies an upstream MJPEG stream into a topic of the form
//! `/video-streams/external-stream/source.mjpeg?url=<escaped url>`. Every
//! received part is republished as a JPEG frame without re-encoding. When
//! the upstream cannot be opened or fails mid-stream, one error frame is
//! published and the handler returns. Either way, and on a clean upstream
//! end, the broker then closes the topic's subscriptions; retrying is left
//! to whoever subscribes again.

use crate::broker::{Context, Handler};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::mjpeg::receiver::DEFAULT_READ_BUFFER;
use crate::mjpeg::{MjpegReceiver, DEFAULT_MAX_PART_SIZE};

use super::EXTERNAL_SOURCE;

/// Topic that proxies the MJPEG stream at `url`
pub fn external_source_topic(url: &str) -> String {
    let escaped: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
    format!("{EXTERNAL_SOURCE}?url={escaped}")
}

/// PUB handler proxying the upstream named by the topic's `url` query
pub fn external_source(client: reqwest::Client) -> impl Handler {
    external_source_with(client, DEFAULT_READ_BUFFER, DEFAULT_MAX_PART_SIZE)
}

/// [`external_source`] with explicit read buffer and part size limits
pub fn external_source_with(
    client: reqwest::Client,
    read_buffer: usize,
    max_part_size: usize,
) -> impl Handler {
    move |ctx: Context| proxy(ctx, client.clone(), read_buffer, max_part_size)
}

/// Publish `err` as a frame so subscribers see it, then hand it back
fn fail(ctx: &Context, err: Error) -> Result<()> {
    let message = err.to_string();
    ctx.publish(Frame::from_error(err));
    Err(Error::Handler(message))
}

async fn proxy(
    ctx: Context,
    client: reqwest::Client,
    read_buffer: usize,
    max_part_size: usize,
) -> Result<()> {
    let Some(source) = ctx.query_param("url").filter(|url| !url.is_empty()) else {
        return fail(
            &ctx,
            Error::InvalidParam("missing query param 'url' to specify the external source".into()),
        );
    };

    let connected = tokio::select! {
        _ = ctx.cancelled() => return Ok(()),
        connected = MjpegReceiver::connect_with_capacity(&client, &source, read_buffer) => connected,
    };
    let mut receiver = match connected {
        Ok(receiver) => receiver.max_part_size(max_part_size),
        Err(e) => return fail(&ctx, e),
    };
    tracing::info!(url = %source, "Proxying external stream");

    loop {
        let received = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            received = receiver.receive() => received,
        };
        match received {
            Ok(Some(frame)) => {
                ctx.publish(frame.into());
            }
            Ok(None) => {
                tracing::info!(url = %source, "External stream ended");
                return Ok(());
            }
            Err(e) => return fail(&ctx, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::broker::{Broker, Hub, Method, Params};
    use crate::mjpeg::upstream_client;

    #[test]
    fn test_topic_escapes_url() {
        assert_eq!(
            external_source_topic("http://cam.local:8080/stream?a=1&b=2"),
            "/video-streams/external-stream/source.mjpeg?url=http%3A%2F%2Fcam.local%3A8080%2Fstream%3Fa%3D1%26b%3D2"
        );
    }

    #[tokio::test]
    async fn test_topic_round_trips_through_query() {
        let url = "http://cam.local/a b?c=d";
        let ctx = Context::new(
            Method::Pub,
            external_source_topic(url),
            Params::new(),
            Hub::new(),
            CancellationToken::new(),
        );
        assert_eq!(ctx.query_param("url").as_deref(), Some(url));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_publishes_one_error_frame() {
        let client = upstream_client(Duration::from_millis(500)).unwrap();
        let broker = Broker::builder()
            .on_pub(EXTERNAL_SOURCE, external_source(client))
            .build();
        let shutdown = CancellationToken::new();
        let serving = broker.clone();
        let token = shutdown.clone();
        let server = tokio::spawn(async move { serving.serve(token).await });

        let topic = external_source_topic("http://127.0.0.1:1/stream.mjpeg");
        let mut sub = broker.subscribe(topic).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.error().is_some());
        assert!(frame.as_jpeg_frame().is_err());

        // The subscription ends right after the error frame
        let next = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await;
        assert!(matches!(next, Ok(None)));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_upstream_end_closes_subscriptions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=b\r\nConnection: close\r\n\r\n--b--\r\n")
                    .await;
            }
        });

        let client = upstream_client(Duration::from_millis(500)).unwrap();
        let broker = Broker::builder()
            .on_pub(EXTERNAL_SOURCE, external_source(client))
            .build();
        let shutdown = CancellationToken::new();
        let serving = broker.clone();
        let token = shutdown.clone();
        let server = tokio::spawn(async move { serving.serve(token).await });

        let topic = external_source_topic(&format!("http://{addr}/stream.mjpeg"));
        for _ in 0..2 {
            let mut sub = broker.subscribe(topic.clone()).await.unwrap();
            let ended = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await;
            assert!(matches!(ended, Ok(None)), "subscriber still waiting after upstream end");
        }

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_url_publishes_error_frame() {
        let hub = Hub::new();
        let token = CancellationToken::new();
        let mut sub = hub.subscribe(EXTERNAL_SOURCE, &token);
        let ctx = Context::new(Method::Pub, EXTERNAL_SOURCE, Params::new(), hub, token);

        let client = upstream_client(Duration::from_millis(100)).unwrap();
        let result = external_source(client).call(ctx).await;
        assert!(result.is_err());

        let frame = sub.recv().await.unwrap();
        match frame.error().map(|e| e.as_ref()) {
            Some(Error::InvalidParam(message)) => assert!(message.contains("url")),
            other => panic!("unexpected error frame: {other:?}"),
        }
    }
}
