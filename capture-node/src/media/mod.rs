//! Source demuxing and segment muxing.
//!
//! A [`Demuxer`] turns one camera URL into codec descriptors followed by an
//! unbounded run of [`Unit`]s. A [`SegmentMuxer`] writes packets of one
//! segment file. [`MediaBackend`] picks the implementation for a URL scheme
//! and for a codec.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;

use crate::error::{CaptureError, Result};

pub mod elementary;
pub mod mjpeg;

#[cfg(feature = "gstreamer")]
pub mod gstreamer_backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Mjpeg,
    Other,
}

/// Encoded, compressed video data for one access unit.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub pts: Option<Duration>,
    pub duration: Option<Duration>,
    pub keyframe: bool,
}

/// Decoded picture, packed RGB24.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    pub pts: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum Unit {
    Packet(Packet),
    Frame(Frame),
}

#[derive(Debug, Clone)]
pub struct CodecDescriptor {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub framerate: Option<u32>,
    /// Caps string reported by the source, when it has one.
    pub caps: Option<String>,
    /// Out-of-band codec header (SPS/PPS for H.264), written at segment start.
    pub header: Bytes,
}

/// What a source carries, captured once at open time.
#[derive(Debug, Clone, Default)]
pub struct CodecDescriptors {
    pub streams: Vec<CodecDescriptor>,
}

impl CodecDescriptors {
    pub fn single(descriptor: CodecDescriptor) -> Self {
        Self {
            streams: vec![descriptor],
        }
    }

    pub fn video(&self) -> Option<&CodecDescriptor> {
        self.streams.first()
    }
}

#[async_trait]
pub trait Demuxer: Send {
    /// Connects and probes. Fails with `SourceUnavailable` when the source
    /// cannot be reached or carries no decodable video.
    async fn open(&mut self, url: &str) -> Result<CodecDescriptors>;

    /// Next unit in source order, `EndOfStream` once the source is exhausted.
    /// Must be cancel-safe: dropping the future loses no data.
    async fn read_unit(&mut self) -> Result<Unit>;

    async fn close(&mut self) -> Result<()>;
}

pub trait DemuxerFactory: Send + Sync {
    fn create(&self, url: &str) -> Result<Box<dyn Demuxer>>;
}

/// Writes the packets of one segment file. Calls block on file I/O; callers
/// run them on the blocking pool.
pub trait SegmentMuxer: Send + Sync {
    fn write_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Writes the trailer and releases the output handle.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait MuxerFactory: Send + Sync {
    fn extension(&self, descriptors: &CodecDescriptors) -> &'static str;

    fn create(&self, path: &Path, descriptors: &CodecDescriptors) -> Result<Box<dyn SegmentMuxer>>;
}

/// Default demuxer and muxer selection.
#[derive(Debug, Default, Clone)]
pub struct MediaBackend;

impl MediaBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DemuxerFactory for MediaBackend {
    fn create(&self, url: &str) -> Result<Box<dyn Demuxer>> {
        let scheme = url.split("://").next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "http" | "https" => Ok(Box::new(mjpeg::MjpegDemuxer::new())),
            #[cfg(feature = "gstreamer")]
            "rtsp" | "rtsps" | "rtmp" | "file" => Ok(Box::new(gstreamer_backend::GstDemuxer::new())),
            _ => Err(CaptureError::SourceUnavailable(format!(
                "no demuxer for '{}' in this build",
                url
            ))),
        }
    }
}

impl MuxerFactory for MediaBackend {
    fn extension(&self, descriptors: &CodecDescriptors) -> &'static str {
        #[cfg(feature = "gstreamer")]
        {
            if gstreamer_backend::GstMuxer::supports(descriptors) {
                return "mp4";
            }
        }
        elementary::extension_for(descriptors)
    }

    fn create(&self, path: &Path, descriptors: &CodecDescriptors) -> Result<Box<dyn SegmentMuxer>> {
        #[cfg(feature = "gstreamer")]
        {
            if gstreamer_backend::GstMuxer::supports(descriptors) {
                return Ok(Box::new(gstreamer_backend::GstMuxer::create(path, descriptors)?));
            }
        }
        Ok(Box::new(elementary::ElementaryMuxer::create(path, descriptors)?))
    }
}
