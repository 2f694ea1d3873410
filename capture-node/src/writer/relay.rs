use async_trait::async_trait;
use tracing::{error, info};

use super::{ClosedSegment, LocalWriter, Writer};
use crate::error::Result;
use crate::media::{CodecDescriptors, Unit};
use crate::upload::{PendingUpload, UploadQueue};

/// Records through its own [`LocalWriter`] and hands every finished segment
/// to the camera's upload queue. The local file is removed once the upload
/// succeeds.
pub struct CloudRelayWriter {
    local: LocalWriter,
    uploads: UploadQueue,
}

impl CloudRelayWriter {
    pub fn new(local: LocalWriter, uploads: UploadQueue) -> Self {
        Self { local, uploads }
    }

    fn relay(&self, segment: ClosedSegment) {
        let ClosedSegment { path, started } = segment;
        if let Err(e) = self.uploads.enqueue(PendingUpload { path, started }) {
            error!(camera = %self.local.camera(), "{}", e);
        }
    }
}

#[async_trait]
impl Writer for CloudRelayWriter {
    fn name(&self) -> &str {
        "cloud-relay"
    }

    async fn open(&mut self, descriptors: &CodecDescriptors) -> Result<()> {
        self.local.open(descriptors).await
    }

    async fn write(&mut self, unit: &Unit) -> Result<()> {
        if let Some(segment) = self.local.write_unit(unit).await? {
            self.relay(segment);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(segment) = self.local.close_segment().await? {
            info!(camera = %self.local.camera(), "Relaying final segment {}", segment.path.display());
            self.relay(segment);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::{CodecDescriptor, MediaBackend, Packet, VideoCodec};
    use crate::upload::testing::RecordingUploader;
    use crate::upload::RelayPolicy;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::task::TaskTracker;

    fn descriptors() -> CodecDescriptors {
        CodecDescriptors::single(CodecDescriptor {
            codec: VideoCodec::Mjpeg,
            width: 320,
            height: 240,
            framerate: None,
            caps: None,
            header: Bytes::new(),
        })
    }

    fn packet() -> Unit {
        Unit::Packet(Packet {
            data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            pts: None,
            duration: None,
            keyframe: true,
        })
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir.join("front_door")).unwrap().count()
    }

    async fn record_seventy_seconds(uploader: Arc<RecordingUploader>, dir: &Path) -> TaskTracker {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap());
        let tracker = TaskTracker::new();
        let local = LocalWriter::new(
            "front_door",
            dir,
            Duration::from_secs(60),
            Arc::new(MediaBackend::new()),
            Arc::new(clock.clone()),
        );
        let policy = RelayPolicy {
            prefix: String::new(),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(5),
        };
        let queue = UploadQueue::spawn("front_door", uploader, policy, &tracker);
        let mut writer = CloudRelayWriter::new(local, queue);

        writer.open(&descriptors()).await.unwrap();
        for _ in 0..700 {
            clock.advance(Duration::from_millis(100));
            writer.write(&packet()).await.unwrap();
        }
        tracker
    }

    #[tokio::test]
    async fn test_rotated_segment_is_uploaded_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(RecordingUploader::default());

        let tracker = record_seventy_seconds(uploader.clone(), dir.path()).await;
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .unwrap();

        assert_eq!(uploader.keys(), vec!["2024-05-10/front_door-2024-05-10-08-00.mjpeg"]);
        // Only the segment that was still recording remains.
        assert_eq!(files_in(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_segment() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(RecordingUploader::failing(usize::MAX));

        let tracker = record_seventy_seconds(uploader.clone(), dir.path()).await;
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .unwrap();

        assert_eq!(uploader.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(uploader.keys().is_empty());
        assert_eq!(files_in(dir.path()), 2);
    }

    #[tokio::test]
    async fn test_close_relays_final_segment() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(RecordingUploader::default());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap());
        let tracker = TaskTracker::new();
        let local = LocalWriter::new(
            "front_door",
            dir.path(),
            Duration::from_secs(60),
            Arc::new(MediaBackend::new()),
            Arc::new(clock.clone()),
        );
        let policy = RelayPolicy {
            prefix: "site-a".to_string(),
            max_attempts: 1,
            retry_backoff: Duration::from_millis(5),
        };
        let queue = UploadQueue::spawn("front_door", uploader.clone(), policy, &tracker);
        let mut writer = CloudRelayWriter::new(local, queue);

        writer.open(&descriptors()).await.unwrap();
        writer.write(&packet()).await.unwrap();
        writer.close().await.unwrap();
        drop(writer);

        tracker.close();
        tracker.wait().await;
        assert_eq!(uploader.keys(), vec!["site-a/2024-05-10/front_door-2024-05-10-08-00.mjpeg"]);
        assert_eq!(files_in(dir.path()), 0);
    }
}
