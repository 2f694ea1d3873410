//! Fakes shared by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::media::{
    CodecDescriptor, CodecDescriptors, Demuxer, DemuxerFactory, Packet, Unit, VideoCodec,
};
use crate::writer::Writer;

#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// `n` numbered packets, then end of stream.
    Finite(u64),
    /// Numbered packets until cancelled.
    Endless,
    /// `n` small JPEG packets, then end of stream.
    Jpeg(u64),
    /// Fails to open.
    Unavailable,
    /// Ends at once, then never finishes closing.
    StuckOnClose,
}

pub struct ScriptedFactory {
    default: Script,
    routes: HashMap<String, Script>,
    pub closes: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            routes: HashMap::new(),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn finite(units: u64) -> Self {
        Self::new(Script::Finite(units))
    }

    pub fn endless() -> Self {
        Self::new(Script::Endless)
    }

    pub fn unavailable() -> Self {
        Self::new(Script::Unavailable)
    }

    pub fn route(mut self, url: &str, script: Script) -> Self {
        self.routes.insert(url.to_string(), script);
        self
    }
}

impl DemuxerFactory for ScriptedFactory {
    fn create(&self, url: &str) -> Result<Box<dyn Demuxer>> {
        let script = self.routes.get(url).copied().unwrap_or(self.default);
        Ok(Box::new(ScriptedDemuxer {
            script,
            next: 0,
            closes: self.closes.clone(),
        }))
    }
}

pub struct ScriptedDemuxer {
    script: Script,
    next: u64,
    closes: Arc<AtomicUsize>,
}

pub fn tiny_jpeg() -> Bytes {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 80)
        .encode(&vec![120u8; 32 * 24 * 3], 32, 24, ColorType::Rgb8)
        .unwrap();
    Bytes::from(out)
}

#[async_trait]
impl Demuxer for ScriptedDemuxer {
    async fn open(&mut self, url: &str) -> Result<CodecDescriptors> {
        let codec = match self.script {
            Script::Unavailable => {
                return Err(CaptureError::SourceUnavailable(format!("{} refused", url)))
            }
            Script::Jpeg(_) => VideoCodec::Mjpeg,
            Script::Finite(_) | Script::Endless | Script::StuckOnClose => VideoCodec::Other,
        };
        Ok(CodecDescriptors::single(CodecDescriptor {
            codec,
            width: 32,
            height: 24,
            framerate: Some(10),
            caps: None,
            header: Bytes::new(),
        }))
    }

    async fn read_unit(&mut self) -> Result<Unit> {
        let index = self.next;
        let data = match self.script {
            Script::Finite(n) if index >= n => return Err(CaptureError::EndOfStream),
            Script::Jpeg(n) if index >= n => return Err(CaptureError::EndOfStream),
            Script::Jpeg(_) => tiny_jpeg(),
            Script::Endless => {
                tokio::task::yield_now().await;
                Bytes::copy_from_slice(&index.to_be_bytes())
            }
            Script::Finite(_) => Bytes::copy_from_slice(&index.to_be_bytes()),
            Script::StuckOnClose => return Err(CaptureError::EndOfStream),
            Script::Unavailable => return Err(CaptureError::ReadError("not open".to_string())),
        };
        self.next += 1;
        Ok(Unit::Packet(Packet {
            data,
            pts: Some(Duration::from_millis(index * 100)),
            duration: Some(Duration::from_millis(100)),
            keyframe: true,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Script::StuckOnClose = self.script {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Counters a [`RecordingWriter`] reports into.
#[derive(Clone, Default)]
pub struct WriterProbe {
    pub seen_units: Arc<Mutex<Vec<u64>>>,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl WriterProbe {
    pub fn seen(&self) -> Vec<u64> {
        self.seen_units.lock().unwrap().clone()
    }
}

pub struct RecordingWriter {
    probe: WriterProbe,
    fail_open: bool,
    fail_writes: bool,
}

impl RecordingWriter {
    pub fn new(probe: &WriterProbe) -> Self {
        Self {
            probe: probe.clone(),
            fail_open: false,
            fail_writes: false,
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

#[async_trait]
impl Writer for RecordingWriter {
    fn name(&self) -> &str {
        "recording"
    }

    async fn open(&mut self, _descriptors: &CodecDescriptors) -> Result<()> {
        if self.fail_open {
            return Err(CaptureError::WriterError("disk full".to_string()));
        }
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&mut self, unit: &Unit) -> Result<()> {
        if self.fail_writes {
            return Err(CaptureError::WriterError("disk full".to_string()));
        }
        if let Unit::Packet(packet) = unit {
            let mut index = [0u8; 8];
            let len = packet.data.len().min(8);
            index[8 - len..].copy_from_slice(&packet.data[..len]);
            self.probe.seen_units.lock().unwrap().push(u64::from_be_bytes(index));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
