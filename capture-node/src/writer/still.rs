use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ColorType, ImageFormat, RgbImage};
use lookout_common::Still;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::Writer;
use crate::clock::Clock;
use crate::config::StillConfig;
use crate::error::{CaptureError, Result};
use crate::media::{CodecDescriptors, Unit, VideoCodec};

enum StillInput {
    Jpeg(Bytes),
    Rgb { width: u32, height: u32, data: Bytes },
}

/// Publishes a scaled-down JPEG of the video at most once per interval.
pub struct StillWriter {
    camera: String,
    width: u32,
    height: u32,
    quality: u8,
    interval: chrono::Duration,
    clock: Arc<dyn Clock>,
    stills: broadcast::Sender<Still>,
    source_codec: Option<VideoCodec>,
    last_attempt: Option<DateTime<Utc>>,
}

impl StillWriter {
    pub fn new(
        camera: &str,
        config: &StillConfig,
        clock: Arc<dyn Clock>,
        stills: broadcast::Sender<Still>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            width: config.width,
            height: config.height,
            quality: config.quality,
            interval: chrono::Duration::from_std(config.interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(1)),
            clock,
            stills,
            source_codec: None,
            last_attempt: None,
        }
    }

    fn due(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt {
            Some(last) => now - last >= self.interval,
            None => true,
        }
    }
}

#[async_trait]
impl Writer for StillWriter {
    fn name(&self) -> &str {
        "still"
    }

    async fn open(&mut self, descriptors: &CodecDescriptors) -> Result<()> {
        self.source_codec = descriptors.video().map(|video| video.codec);
        Ok(())
    }

    async fn write(&mut self, unit: &Unit) -> Result<()> {
        let now = self.clock.now();
        if !self.due(now) {
            return Ok(());
        }

        let input = match unit {
            Unit::Frame(frame) => StillInput::Rgb {
                width: frame.width,
                height: frame.height,
                data: frame.data.clone(),
            },
            Unit::Packet(packet) if self.source_codec == Some(VideoCodec::Mjpeg) => {
                StillInput::Jpeg(packet.data.clone())
            }
            // Compressed non-JPEG packets; the decoded frame follows separately.
            Unit::Packet(_) => return Ok(()),
        };

        self.last_attempt = Some(now);
        let (width, height, quality) = (self.width, self.height, self.quality);
        let jpeg = tokio::task::spawn_blocking(move || render_still(input, width, height, quality)).await??;

        debug!(camera = %self.camera, "Still ready ({} bytes)", jpeg.len());
        // No subscribers is fine; the still is simply dropped.
        let _ = self.stills.send(Still::new(jpeg, now));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn render_still(input: StillInput, width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let image = match input {
        StillInput::Jpeg(data) => image::load_from_memory_with_format(&data, ImageFormat::Jpeg)?.to_rgb8(),
        StillInput::Rgb {
            width: w,
            height: h,
            data,
        } => RgbImage::from_raw(w, h, data.to_vec()).ok_or_else(|| {
            CaptureError::WriterError(format!("frame buffer does not hold {}x{} RGB", w, h))
        })?,
    };

    let scaled = if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, FilterType::Triangle)
    };

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode(scaled.as_raw(), width, height, ColorType::Rgb8)?;
    Ok(out)
}
