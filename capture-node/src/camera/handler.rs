use dashmap::DashMap;
use futures::future::join_all;
use lookout_common::{CameraSummary, Still, StillSource};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::Camera;
use crate::clock::{Clock, SystemClock};
use crate::config::{CaptureConfig, StorageMode};
use crate::error::{CaptureError, Result};
use crate::media::{DemuxerFactory, MediaBackend, MuxerFactory};
use crate::stream::{Stream, StreamState};
use crate::upload::{RelayPolicy, UploadQueue, Uploader};
use crate::writer::{CloudRelayWriter, LocalWriter, StillWriter, Writer};

const CONSUMER_GRACE: Duration = Duration::from_secs(5);
const STREAM_CLOSE_GRACE: Duration = Duration::from_secs(10);

/// Owns every camera and its stream, and routes stills back onto cameras.
pub struct CameraHandler {
    config: CaptureConfig,
    cameras: DashMap<String, Arc<Camera>>,
    streams: Mutex<HashMap<String, Stream>>,
    states: DashMap<String, watch::Receiver<StreamState>>,
    consumers: TaskTracker,
    uploads: TaskTracker,
    demuxers: Arc<dyn DemuxerFactory>,
    muxers: Arc<dyn MuxerFactory>,
    uploader: Option<Arc<dyn Uploader>>,
    clock: Arc<dyn Clock>,
    close_grace: Duration,
}

impl CameraHandler {
    /// Registers every configured camera. Nothing connects until
    /// [`start_streams`](Self::start_streams).
    pub fn new(config: CaptureConfig) -> Self {
        let backend = Arc::new(MediaBackend::new());
        let handler = Self {
            cameras: DashMap::new(),
            streams: Mutex::new(HashMap::new()),
            states: DashMap::new(),
            consumers: TaskTracker::new(),
            uploads: TaskTracker::new(),
            demuxers: backend.clone(),
            muxers: backend,
            uploader: None,
            clock: Arc::new(SystemClock),
            close_grace: STREAM_CLOSE_GRACE,
            config,
        };

        for camera in &handler.config.cameras {
            handler.add_camera(Camera::from_config(camera, handler.config.storage.rotation_interval));
        }
        handler
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_media(mut self, demuxers: Arc<dyn DemuxerFactory>, muxers: Arc<dyn MuxerFactory>) -> Self {
        self.demuxers = demuxers;
        self.muxers = muxers;
        self
    }

    /// How long `close_streams` waits for each stream before abandoning it.
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Registers `camera` under its name, replacing any camera of that name.
    pub fn add_camera(&self, camera: Camera) {
        let name = camera.name().to_string();
        if self.cameras.insert(name.clone(), Arc::new(camera)).is_some() {
            warn!(camera = %name, "Camera registered twice, keeping the latest");
        }
    }

    pub fn camera(&self, name: &str) -> Option<Arc<Camera>> {
        self.cameras.get(name).map(|c| c.value().clone())
    }

    pub fn camera_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cameras.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// State of every stream that was started, by camera name.
    pub fn stream_states(&self) -> BTreeMap<String, StreamState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value().borrow()))
            .collect()
    }

    /// Builds, opens and starts one stream per camera. Only invalid storage
    /// settings are fatal; a camera whose source cannot be opened is logged
    /// and left without a stream.
    pub async fn start_streams(&self) -> Result<()> {
        self.validate_storage()?;

        let mut streams = self.streams.lock().await;
        for name in self.camera_names() {
            if streams.contains_key(&name) {
                debug!(camera = %name, "Stream already running");
                continue;
            }
            let Some(camera) = self.camera(&name) else {
                continue;
            };

            match self.launch(&camera).await {
                Ok(stream) => {
                    self.states.insert(name.clone(), stream.subscribe_state());
                    streams.insert(name, stream);
                }
                Err(e) => {
                    error!(camera = %name, "Camera has no stream: {}", e);
                }
            }
        }

        info!("{} of {} camera(s) streaming", streams.len(), self.cameras.len());
        Ok(())
    }

    /// Cleans up every stream, then waits for still consumers and pending
    /// uploads. Every wait is bounded; a stream that does not close in time is
    /// dropped with its tasks left running.
    pub async fn close_streams(&self) {
        let streams: Vec<Stream> = {
            let mut guard = self.streams.lock().await;
            guard.drain().map(|(_, stream)| stream).collect()
        };
        info!("Closing {} stream(s)", streams.len());

        let grace = self.close_grace;
        join_all(streams.into_iter().map(|mut stream| async move {
            if tokio::time::timeout(grace, stream.cleanup()).await.is_err() {
                warn!(camera = %stream.camera(), "Stream did not close within {:?}, abandoning it", grace);
            }
        }))
        .await;

        self.consumers.close();
        if tokio::time::timeout(CONSUMER_GRACE, self.consumers.wait())
            .await
            .is_err()
        {
            warn!("Still consumers did not finish within {:?}", CONSUMER_GRACE);
        }

        self.uploads.close();
        let grace = self.config.cloud.shutdown_grace;
        if tokio::time::timeout(grace, self.uploads.wait()).await.is_err() {
            warn!("Uploads still pending after {:?}; their segments stay on disk", grace);
        }
    }

    fn validate_storage(&self) -> Result<()> {
        if self.config.storage.mode != StorageMode::S3 {
            return Ok(());
        }
        if !self.config.cloud.ready() {
            return Err(CaptureError::ConfigError(
                "storage mode s3 needs bucket, region, access_key and secret_key".to_string(),
            ));
        }
        if self.uploader.is_none() {
            return Err(CaptureError::ConfigError(
                "storage mode s3 needs an uploader".to_string(),
            ));
        }
        Ok(())
    }

    async fn launch(&self, camera: &Arc<Camera>) -> Result<Stream> {
        let name = camera.name();
        let mut stream = Stream::new(name, camera.source_url());

        let stills = stream
            .stills_sender()
            .ok_or_else(|| CaptureError::InvalidState("stills channel already closed".to_string()))?;
        stream
            .add_writer(Box::new(StillWriter::new(
                name,
                &self.config.still,
                self.clock.clone(),
                stills,
            )))
            .await?;
        if let Some(writer) = self.storage_writer(camera) {
            stream.add_writer(writer).await?;
        }

        stream.open(self.demuxers.as_ref()).await?;
        let receiver = stream.stills();
        stream.start()?;

        let camera = camera.clone();
        self.consumers.spawn(async move {
            let mut receiver = receiver;
            loop {
                match receiver.recv().await {
                    Ok(still) => camera.set_latest_image(still),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(camera = %camera.name(), "Skipped {} stale still(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(camera = %camera.name(), "Still consumer finished");
        });

        Ok(stream)
    }

    fn storage_writer(&self, camera: &Camera) -> Option<Box<dyn Writer>> {
        let local = || {
            LocalWriter::new(
                camera.name(),
                &self.config.storage.segment_dir,
                camera.record_interval(),
                self.muxers.clone(),
                self.clock.clone(),
            )
        };

        match self.config.storage.mode {
            StorageMode::Disabled => None,
            StorageMode::Local => Some(Box::new(local())),
            StorageMode::S3 => {
                let uploader = self.uploader.clone()?;
                let queue = UploadQueue::spawn(
                    camera.name(),
                    uploader,
                    RelayPolicy::from_config(&self.config.cloud),
                    &self.uploads,
                );
                Some(Box::new(CloudRelayWriter::new(local(), queue)))
            }
        }
    }
}

impl StillSource for CameraHandler {
    fn latest_still(&self, camera: &str) -> Option<Still> {
        self.camera(camera)?.latest_image()
    }

    fn cameras(&self) -> Vec<CameraSummary> {
        self.camera_names()
            .into_iter()
            .filter_map(|name| self.camera(&name))
            .map(|camera| {
                let latest = camera.latest_image();
                CameraSummary {
                    name: camera.name().to_string(),
                    has_image: latest.is_some(),
                    captured_at: latest.as_ref().map(|still| still.captured_at()),
                    image_bytes: latest.as_ref().map(|still| still.len()).unwrap_or(0),
                }
            })
            .collect()
    }
}
