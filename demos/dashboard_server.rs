//! Video server for an instrument dashboard
//!
//! Run with: cargo run --example dashboard_server [BIND_ADDR] [CAMERA_URL]
//!
//! Examples:
//!   cargo run --example dashboard_server                              # binds to 0.0.0.0:3000
//!   cargo run --example dashboard_server localhost:3001               # binds to 127.0.0.1:3001
//!   cargo run --example dashboard_server localhost http://cam/mjpeg   # camera 1 streams from that URL
//!
//! Other settings come from `VIDSTREAM_*` environment variables
//! (`VIDSTREAM_MAX_CONNECTIONS`, `VIDSTREAM_CABLE_PING_INTERVAL_MS`,
//! `VIDSTREAM_SOURCE_TICK_MS`).
//!
//! ## Endpoints
//!
//!   /video-streams/animated-color/frame.jpeg?width=640&height=480
//!   /video-streams/animated-color/stream.mjpeg?annotated=true
//!   /video-streams/external-stream/stream.mjpeg?url=<escaped url>
//!   /instruments/cameras/1/frame.jpeg
//!   /instruments/cameras/1/stream.mjpeg
//!   /video-cable  (websocket, Video::StreamsChannel)

use std::net::SocketAddr;
use std::sync::Arc;

use vidstream::sources::{Camera, MemoryCameraStore};
use vidstream::{ServerConfig, VideoServer};

/// Parse bind address from command line argument.
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:3000
/// - "localhost:3001" -> 127.0.0.1:3001
/// - "127.0.0.1" -> 127.0.0.1:3000
/// - "0.0.0.0:3000" -> 0.0.0.0:3000
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 3000;

    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: dashboard_server [BIND_ADDR] [CAMERA_URL]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR     Address to bind to (default: $VIDSTREAM_BIND_ADDR or 0.0.0.0:3000)");
    eprintln!("  CAMERA_URL    MJPEG stream served as camera 1 (default: the animated color stream)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vidstream=debug".parse()?)
                .add_directive("dashboard_server=debug".parse()?),
        )
        .init();

    let mut config = ServerConfig::from_env()?;
    if let Some(addr) = args.get(1) {
        match parse_bind_addr(addr) {
            Ok(addr) => config = config.bind(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    let camera_url = match args.get(2) {
        Some(url) => url.clone(),
        None => format!(
            "http://127.0.0.1:{}/video-streams/animated-color/stream.mjpeg?width=640&height=480",
            config.bind_addr.port()
        ),
    };

    let cameras = Arc::new(MemoryCameraStore::new());
    cameras
        .upsert(Camera {
            id: 1,
            url: camera_url.clone(),
            protocol: "mjpeg".into(),
            enabled: true,
        })
        .await;

    println!("Starting video server on {}", config.bind_addr);
    println!("Camera 1: {}", camera_url);
    println!();
    println!("=== Watch a stream ===");
    println!("Browser: http://localhost:{}/instruments/cameras/1/stream.mjpeg", config.bind_addr.port());
    println!("ffplay:  ffplay http://localhost:{}/video-streams/animated-color/stream.mjpeg", config.bind_addr.port());
    println!();

    let server = VideoServer::new(config, cameras)?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await?;

    Ok(())
}
