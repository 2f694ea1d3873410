//! RTSP, RTMP and file sources through GStreamer, and MP4 segments for H.264.

use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    CodecDescriptor, CodecDescriptors, Demuxer, Frame, Packet, SegmentMuxer, Unit, VideoCodec,
};
use crate::error::{CaptureError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const UNIT_BUFFER: usize = 64;
const CLOSE_MESSAGE: &str = "lookout-close";
/// Everything after the H.264 source: byte-stream packets on one branch,
/// decoded RGB frames on the other.
const DEMUX_TAIL: &str = "h264parse config-interval=-1 \
    ! video/x-h264,stream-format=byte-stream,alignment=au ! tee name=t \
    t. ! queue ! appsink name=packets sync=false \
    t. ! queue leaky=downstream max-size-buffers=2 ! avdec_h264 ! videoconvert \
    ! video/x-raw,format=RGB ! appsink name=frames sync=false max-buffers=2 drop=true";

pub struct GstDemuxer {
    pipeline: Option<gst::Pipeline>,
    units: Option<mpsc::Receiver<Result<Unit>>>,
    pending: Option<Unit>,
}

impl GstDemuxer {
    pub fn new() -> Self {
        Self {
            pipeline: None,
            units: None,
            pending: None,
        }
    }

    fn launch_description(url: &str) -> String {
        let source = if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            format!(
                "rtspsrc location=\"{}\" latency=200 protocols=tcp ! rtph264depay",
                url
            )
        } else {
            format!("urisourcebin uri=\"{}\" ! parsebin", url)
        };
        format!("{} ! {}", source, DEMUX_TAIL)
    }

    fn appsink(pipeline: &gst::Pipeline, name: &str) -> Result<AppSink> {
        pipeline
            .by_name(name)
            .ok_or_else(|| CaptureError::MediaError(format!("no appsink '{}' in pipeline", name)))?
            .downcast::<AppSink>()
            .map_err(|_| CaptureError::MediaError(format!("'{}' is not an appsink", name)))
    }

    fn wire_packets(sink: &AppSink, tx: mpsc::Sender<Result<Unit>>, caps: Arc<Mutex<Option<gst::Caps>>>) {
        sink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    if let Ok(mut slot) = caps.lock() {
                        if slot.is_none() {
                            *slot = sample.caps_owned();
                        }
                    }
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let packet = Packet {
                        data: Bytes::copy_from_slice(map.as_slice()),
                        pts: buffer.pts().map(|t| Duration::from_nanos(t.nseconds())),
                        duration: buffer.duration().map(|t| Duration::from_nanos(t.nseconds())),
                        keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
                    };

                    // Packets are never dropped: block the streaming thread instead.
                    tx.blocking_send(Ok(Unit::Packet(packet)))
                        .map_err(|_| gst::FlowError::Flushing)?;
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    fn wire_frames(sink: &AppSink, tx: mpsc::Sender<Result<Unit>>) {
        sink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let info = gstreamer_video::VideoInfo::from_caps(caps)
                        .map_err(|_| gst::FlowError::NotNegotiated)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let width = info.width();
                    let height = info.height();
                    let row = (width * 3) as usize;
                    let stride = info.stride()[0] as usize;
                    let data = if stride == row {
                        Bytes::copy_from_slice(map.as_slice())
                    } else {
                        let mut packed = Vec::with_capacity(row * height as usize);
                        for line in map.as_slice().chunks(stride).take(height as usize) {
                            packed.extend_from_slice(&line[..row.min(line.len())]);
                        }
                        Bytes::from(packed)
                    };

                    let frame = Frame {
                        width,
                        height,
                        data,
                        pts: buffer.pts().map(|t| Duration::from_nanos(t.nseconds())),
                    };

                    // Decoded frames only feed previews, drop them when the reader lags.
                    let _ = tx.try_send(Ok(Unit::Frame(frame)));
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    fn watch_bus(pipeline: &gst::Pipeline, tx: mpsc::Sender<Result<Unit>>) -> Result<()> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| CaptureError::MediaError("pipeline has no bus".to_string()))?;

        std::thread::spawn(move || {
            for msg in bus.iter_timed(gst::ClockTime::NONE) {
                match msg.view() {
                    gst::MessageView::Eos(..) => {
                        let _ = tx.blocking_send(Err(CaptureError::EndOfStream));
                        break;
                    }
                    gst::MessageView::Error(err) => {
                        let _ = tx.blocking_send(Err(CaptureError::ReadError(format!(
                            "{} ({:?})",
                            err.error(),
                            err.debug()
                        ))));
                        break;
                    }
                    gst::MessageView::Application(app)
                        if app.structure().map(|s| s.has_name(CLOSE_MESSAGE)).unwrap_or(false) =>
                    {
                        break;
                    }
                    _ => {}
                }
            }
            debug!("GStreamer bus watcher exited");
        });
        Ok(())
    }

    fn descriptor_from_caps(caps: Option<gst::Caps>) -> Result<CodecDescriptor> {
        let caps = caps.ok_or_else(|| CaptureError::SourceUnavailable("no caps negotiated".to_string()))?;
        let structure = caps
            .structure(0)
            .ok_or_else(|| CaptureError::SourceUnavailable("empty caps".to_string()))?;

        let width = structure.get::<i32>("width").unwrap_or(0).max(0) as u32;
        let height = structure.get::<i32>("height").unwrap_or(0).max(0) as u32;
        let framerate = structure
            .get::<gst::Fraction>("framerate")
            .ok()
            .filter(|f| f.denom() > 0)
            .map(|f| (f.numer() / f.denom()).max(0) as u32);

        Ok(CodecDescriptor {
            codec: VideoCodec::H264,
            width,
            height,
            framerate,
            caps: Some(caps.to_string()),
            header: Bytes::new(),
        })
    }

    /// Detaches the pipeline from the reader. The unit channel closes first so
    /// a streaming thread parked in `blocking_send` returns `Flushing` instead
    /// of holding up the state change.
    fn release(&mut self) -> Option<gst::Pipeline> {
        self.units = None;
        self.pending = None;

        let pipeline = self.pipeline.take()?;
        if let Some(bus) = pipeline.bus() {
            let _ = bus.post(gst::message::Application::new(gst::Structure::new_empty(
                CLOSE_MESSAGE,
            )));
        }
        Some(pipeline)
    }

    fn stop(pipeline: &gst::Pipeline) {
        if let Err(e) = pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop GStreamer pipeline: {}", e);
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(pipeline) = self.release() {
            tokio::task::spawn_blocking(move || Self::stop(&pipeline)).await?;
        }
        Ok(())
    }

    async fn start(&mut self, description: &str, label: &str) -> Result<CodecDescriptors> {
        gst::init()?;

        debug!("Creating GStreamer pipeline: {}", description);
        let pipeline = gst::parse::launch(description)
            .map_err(|e| CaptureError::SourceUnavailable(format!("{}: {}", label, e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::MediaError("launch line is not a pipeline".to_string()))?;

        let (tx, rx) = mpsc::channel(UNIT_BUFFER);
        let caps = Arc::new(Mutex::new(None));
        Self::wire_packets(&Self::appsink(&pipeline, "packets")?, tx.clone(), caps.clone());
        Self::wire_frames(&Self::appsink(&pipeline, "frames")?, tx.clone());
        Self::watch_bus(&pipeline, tx)?;

        self.pipeline = Some(pipeline.clone());
        self.units = Some(rx);

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = self.shutdown().await;
            return Err(CaptureError::SourceUnavailable(format!("{}: {}", label, e)));
        }

        let first = loop {
            let next = match self.units.as_mut() {
                Some(units) => tokio::time::timeout(PROBE_TIMEOUT, units.recv()).await,
                None => break None,
            };
            match next {
                Ok(Some(Ok(Unit::Packet(packet)))) => break Some(Unit::Packet(packet)),
                Ok(Some(Ok(Unit::Frame(_)))) => continue,
                Ok(Some(Err(e))) => {
                    warn!("{} failed while probing: {}", label, e);
                    break None;
                }
                Ok(None) | Err(_) => break None,
            }
        };

        let Some(first) = first else {
            let _ = self.shutdown().await;
            return Err(CaptureError::SourceUnavailable(format!(
                "{}: no H.264 video within {:?}",
                label, PROBE_TIMEOUT
            )));
        };

        let slot = caps.lock().ok().and_then(|mut slot| slot.take());
        let descriptor = match Self::descriptor_from_caps(slot) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                let _ = self.shutdown().await;
                return Err(e);
            }
        };

        info!(
            "GStreamer source {} is {}x{} H.264",
            label, descriptor.width, descriptor.height
        );
        self.pending = Some(first);
        Ok(CodecDescriptors::single(descriptor))
    }
}

impl Default for GstDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Demuxer for GstDemuxer {
    async fn open(&mut self, url: &str) -> Result<CodecDescriptors> {
        self.start(&Self::launch_description(url), url).await
    }

    async fn read_unit(&mut self) -> Result<Unit> {
        if let Some(unit) = self.pending.take() {
            return Ok(unit);
        }
        let units = self
            .units
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidState("demuxer is not open".to_string()))?;
        match units.recv().await {
            Some(unit) => unit,
            None => Err(CaptureError::EndOfStream),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown().await
    }
}

impl Drop for GstDemuxer {
    fn drop(&mut self) {
        if let Some(pipeline) = self.release() {
            Self::stop(&pipeline);
        }
    }
}

/// appsrc → h264parse → mp4mux → filesink.
pub struct GstMuxer {
    path: PathBuf,
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    base_pts: Option<Duration>,
}

impl GstMuxer {
    pub fn supports(descriptors: &CodecDescriptors) -> bool {
        matches!(descriptors.video().map(|v| v.codec), Some(VideoCodec::H264))
    }

    pub fn create(path: &Path, descriptors: &CodecDescriptors) -> Result<Self> {
        gst::init()?;
        let video = descriptors
            .video()
            .ok_or_else(|| CaptureError::WriterError("source has no video stream".to_string()))?;

        let mut caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au");
        if video.width > 0 && video.height > 0 {
            caps = caps
                .field("width", video.width as i32)
                .field("height", video.height as i32);
        }
        if let Some(fps) = video.framerate.filter(|fps| *fps > 0) {
            caps = caps.field("framerate", gst::Fraction::new(fps as i32, 1));
        }

        let pipeline = gst::Pipeline::new();
        let appsrc = AppSrc::builder()
            .caps(&caps.build())
            .format(gst::Format::Time)
            .is_live(true)
            .build();
        let parser = gst::ElementFactory::make("h264parse").build()?;
        let muxer = gst::ElementFactory::make("mp4mux")
            .property("faststart", true)
            .build()?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("async", false)
            .build()?;

        pipeline.add_many([appsrc.upcast_ref(), &parser, &muxer, &filesink])?;
        gst::Element::link_many([appsrc.upcast_ref(), &parser, &muxer, &filesink])?;
        pipeline.set_state(gst::State::Playing)?;

        Ok(Self {
            path: path.to_path_buf(),
            pipeline,
            appsrc,
            base_pts: None,
        })
    }
}

impl SegmentMuxer for GstMuxer {
    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut buffer = gst::Buffer::from_slice(packet.data.clone());
        if let Some(buffer_ref) = buffer.get_mut() {
            if let Some(pts) = packet.pts {
                let base = *self.base_pts.get_or_insert(pts);
                let relative = pts.saturating_sub(base);
                buffer_ref.set_pts(gst::ClockTime::from_nseconds(relative.as_nanos() as u64));
            }
            if let Some(duration) = packet.duration {
                buffer_ref.set_duration(gst::ClockTime::from_nseconds(duration.as_nanos() as u64));
            }
            if !packet.keyframe {
                buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| CaptureError::WriterError(format!("{}: push failed: {:?}", self.path.display(), e)))?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        if let Err(e) = self.appsrc.end_of_stream() {
            warn!("{}: failed to send EOS: {:?}", self.path.display(), e);
        }

        let mut failure = None;
        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(5)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        failure = Some(format!("{} ({:?})", err.error(), err.debug()));
                        break;
                    }
                    _ => {}
                }
            }
        }

        let _ = self.pipeline.set_state(gst::State::Null);
        match failure {
            Some(message) => Err(CaptureError::WriterError(format!(
                "{}: {}",
                self.path.display(),
                message
            ))),
            None => Ok(()),
        }
    }
}

impl Drop for GstMuxer {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
