//! HTTP and websocket server
//!
//! Serves snapshots and MJPEG streams of broker topics over HTTP, and the
//! cable bridge on `/video-cable`.

pub mod config;
pub mod listener;
pub mod routes;

pub use config::ServerConfig;
pub use listener::{build_broker, VideoServer};
pub use routes::{router, AppState};
