//! Live video streaming for instrument cameras
//!
//! A topic-based [`Broker`] runs frame sources on demand: a source starts
//! when its topic gets a first subscriber and is cancelled when the last one
//! leaves. Frames flow through a small pipeline ([`frame`]) that decodes,
//! resizes, annotates and re-encodes JPEG images, and leave the process as
//! MJPEG over HTTP ([`mjpeg`], [`server`]) or as base64 JPEG messages over
//! an Action Cable websocket ([`cable`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use vidstream::sources::MemoryCameraStore;
//! use vidstream::{ServerConfig, VideoServer};
//!
//! # async fn run() -> vidstream::Result<()> {
//! let cameras = Arc::new(MemoryCameraStore::new());
//! let server = VideoServer::new(ServerConfig::from_env()?, cameras)?;
//! server
//!     .run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! # }
//! ```

pub mod broker;
pub mod cable;
pub mod error;
pub mod frame;
pub mod mjpeg;
pub mod server;
pub mod sources;
pub mod stats;

pub use broker::{Broker, Context, Handler, Method, Subscription};
pub use error::{Error, Result};
pub use frame::{Frame, ImageFrame, JpegFrame};
pub use server::{ServerConfig, VideoServer};
