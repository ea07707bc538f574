//! Instrument cameras
//!
//! Cameras are looked up through a [`CameraStore`]; the database behind it
//! lives outside this crate. A camera's stream topic republishes its
//! external MJPEG source as JPEG frames, so however many websocket clients
//! watch a camera, each upstream frame is encoded at most once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::broker::{Context, Handler};
use crate::error::{Error, Result};

use super::{external_source_topic, failed_frame, loading_frame};

/// Camera identifier
pub type CameraId = i64;

/// Route parameter naming the camera in [`super::CAMERA_STREAM`]
pub const CAMERA_ID_PARAM: &str = "camera_id";

/// A camera attached to an instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Camera {
    pub id: CameraId,
    /// Upstream stream URL
    pub url: String,
    /// Upstream protocol, e.g. `mjpeg`
    pub protocol: String,
    pub enabled: bool,
}

/// Lookup of camera records
#[async_trait]
pub trait CameraStore: Send + Sync + 'static {
    /// The camera with `id`, if it exists
    async fn get_camera(&self, id: CameraId) -> Result<Option<Camera>>;
}

/// In-memory camera store
#[derive(Debug, Default)]
pub struct MemoryCameraStore {
    cameras: RwLock<HashMap<CameraId, Camera>>,
}

impl MemoryCameraStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a camera
    pub async fn upsert(&self, camera: Camera) {
        self.cameras.write().await.insert(camera.id, camera);
    }

    /// Remove a camera, returning it if it existed
    pub async fn remove(&self, id: CameraId) -> Option<Camera> {
        self.cameras.write().await.remove(&id)
    }

    /// All cameras, ordered by id
    pub async fn list(&self) -> Vec<Camera> {
        let mut cameras: Vec<Camera> = self.cameras.read().await.values().cloned().collect();
        cameras.sort_by_key(|camera| camera.id);
        cameras
    }
}

#[async_trait]
impl CameraStore for MemoryCameraStore {
    async fn get_camera(&self, id: CameraId) -> Result<Option<Camera>> {
        Ok(self.cameras.read().await.get(&id).cloned())
    }
}

/// Parse a camera id route parameter
pub fn parse_camera_id(raw: &str) -> Result<CameraId> {
    raw.parse()
        .map_err(|_| Error::InvalidParam(format!("invalid camera id {raw}")))
}

/// PUB handler republishing a camera's upstream stream as JPEG frames
pub fn camera_stream_source(store: Arc<dyn CameraStore>) -> impl Handler {
    move |ctx: Context| republish(ctx, Arc::clone(&store))
}

async fn republish(ctx: Context, store: Arc<dyn CameraStore>) -> Result<()> {
    let id = parse_camera_id(ctx.require_param(CAMERA_ID_PARAM)?)?;
    let camera = store
        .get_camera(id)
        .await?
        .ok_or_else(|| Error::InvalidParam(format!("camera {id} not found")))?;

    ctx.publish(loading_frame().into());
    let mut source = ctx.subscribe(external_source_topic(&camera.url));

    loop {
        let frame = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            frame = source.recv() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        // Encode once here rather than once per websocket subscriber
        match frame.as_jpeg_frame() {
            Ok(jpeg) => {
                ctx.publish(jpeg.into());
            }
            Err(e) => {
                ctx.publish(failed_frame().into());
                return Err(e);
            }
        }
    }
}
