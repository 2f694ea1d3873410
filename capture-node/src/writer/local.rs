use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lookout_common::utils::format_duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::Writer;
use crate::clock::Clock;
use crate::error::{CaptureError, Result};
use crate::media::{CodecDescriptors, MuxerFactory, SegmentMuxer, Unit};

/// A segment that has been finalized on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSegment {
    pub path: PathBuf,
    pub started: DateTime<Utc>,
}

struct OpenSegment {
    path: PathBuf,
    started: DateTime<Utc>,
    next_rotation: DateTime<Utc>,
    muxer: Box<dyn SegmentMuxer>,
}

/// Records packets into `<segment_dir>/<camera>/<camera>-YYYY-MM-DD-HH-MM.<ext>`,
/// starting a new file whenever the rotation interval has elapsed.
pub struct LocalWriter {
    camera: String,
    dir: PathBuf,
    interval: Duration,
    muxers: Arc<dyn MuxerFactory>,
    clock: Arc<dyn Clock>,
    descriptors: Option<CodecDescriptors>,
    segment: Option<OpenSegment>,
}

impl LocalWriter {
    pub fn new(
        camera: &str,
        segment_dir: &Path,
        interval: Duration,
        muxers: Arc<dyn MuxerFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            dir: segment_dir.join(camera),
            interval,
            muxers,
            clock,
            descriptors: None,
            segment: None,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn current_segment(&self) -> Option<&Path> {
        self.segment.as_ref().map(|segment| segment.path.as_path())
    }

    /// Appends one unit. Returns the segment that was finalized if this write
    /// triggered a rotation.
    pub async fn write_unit(&mut self, unit: &Unit) -> Result<Option<ClosedSegment>> {
        let Unit::Packet(packet) = unit else {
            return Ok(None);
        };

        if self.segment.is_none() {
            self.open_segment()
                .await
                .map_err(|e| CaptureError::RotationError(format!("{}: {}", self.camera, e)))?;
        }

        let mut segment = self
            .segment
            .take()
            .ok_or_else(|| CaptureError::InvalidState("no open segment".to_string()))?;
        let packet = packet.clone();
        let (segment, written) = tokio::task::spawn_blocking(move || {
            let written = segment.muxer.write_packet(&packet);
            (segment, written)
        })
        .await?;
        let next_rotation = segment.next_rotation;
        self.segment = Some(segment);
        written?;

        if self.clock.now() > next_rotation {
            return Ok(self.rotate().await);
        }
        Ok(None)
    }

    /// Finalizes the open segment, if any.
    pub async fn close_segment(&mut self) -> Result<Option<ClosedSegment>> {
        let Some(segment) = self.segment.take() else {
            return Ok(None);
        };

        let OpenSegment {
            path,
            started,
            muxer,
            ..
        } = segment;
        tokio::task::spawn_blocking(move || muxer.finish()).await??;

        debug!(camera = %self.camera, "Closed segment {}", path.display());
        Ok(Some(ClosedSegment { path, started }))
    }

    async fn rotate(&mut self) -> Option<ClosedSegment> {
        let closed = match self.close_segment().await {
            Ok(closed) => closed,
            Err(e) => {
                error!(camera = %self.camera, "Rotation error: failed to finalize segment: {}", e);
                None
            }
        };

        if let Err(e) = self.open_segment().await {
            error!(camera = %self.camera, "Rotation error: failed to open next segment: {}", e);
        }
        closed
    }

    async fn open_segment(&mut self) -> Result<()> {
        let descriptors = self
            .descriptors
            .clone()
            .ok_or_else(|| CaptureError::InvalidState("writer was never opened".to_string()))?;

        let started = self.clock.now();
        let extension = self.muxers.extension(&descriptors);
        let path = segment_path(&self.dir, &self.camera, started, extension).await?;

        let muxers = Arc::clone(&self.muxers);
        let muxer_path = path.clone();
        let muxer =
            tokio::task::spawn_blocking(move || muxers.create(&muxer_path, &descriptors)).await??;
        let interval = chrono::Duration::from_std(self.interval)
            .map_err(|e| CaptureError::ConfigError(format!("rotation interval: {}", e)))?;

        info!(camera = %self.camera, "Recording to {}", path.display());
        self.segment = Some(OpenSegment {
            path,
            started,
            next_rotation: started + interval,
            muxer,
        });
        Ok(())
    }
}

/// First free `<camera>-YYYY-MM-DD-HH-MM[-N].<ext>` name in `dir`.
async fn segment_path(
    dir: &Path,
    camera: &str,
    started: DateTime<Utc>,
    extension: &str,
) -> Result<PathBuf> {
    let stem = format!("{}-{}", camera, started.format("%Y-%m-%d-%H-%M"));
    let mut path = dir.join(format!("{}.{}", stem, extension));
    let mut suffix = 1;
    while tokio::fs::try_exists(&path).await? {
        path = dir.join(format!("{}-{}.{}", stem, suffix, extension));
        suffix += 1;
    }
    Ok(path)
}

#[async_trait]
impl Writer for LocalWriter {
    fn name(&self) -> &str {
        "local"
    }

    async fn open(&mut self, descriptors: &CodecDescriptors) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.descriptors = Some(descriptors.clone());
        self.open_segment().await?;
        info!(
            camera = %self.camera,
            "Local recording every {} into {}",
            format_duration(self.interval),
            self.dir.display()
        );
        Ok(())
    }

    async fn write(&mut self, unit: &Unit) -> Result<()> {
        self.write_unit(unit).await.map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        self.close_segment().await.map(|_| ())
    }
}
