//! Raw elementary-stream segments: the codec header followed by every
//! packet, back to back. Playable by anything that reads Annex B H.264 or
//! concatenated JPEG.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{CodecDescriptors, Packet, SegmentMuxer, VideoCodec};
use crate::error::{CaptureError, Result};

pub fn extension_for(descriptors: &CodecDescriptors) -> &'static str {
    match descriptors.video().map(|video| video.codec) {
        Some(VideoCodec::H264) => "h264",
        Some(VideoCodec::H265) => "h265",
        Some(VideoCodec::Mjpeg) => "mjpeg",
        Some(VideoCodec::Other) | None => "bin",
    }
}

pub struct ElementaryMuxer {
    path: PathBuf,
    out: BufWriter<File>,
    bytes_written: u64,
}

impl ElementaryMuxer {
    pub fn create(path: &Path, descriptors: &CodecDescriptors) -> Result<Self> {
        let video = descriptors
            .video()
            .ok_or_else(|| CaptureError::WriterError("source has no video stream".to_string()))?;

        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&video.header)?;

        Ok(Self {
            path: path.to_path_buf(),
            out,
            bytes_written: video.header.len() as u64,
        })
    }
}

impl SegmentMuxer for ElementaryMuxer {
    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.out.write_all(&packet.data)?;
        self.bytes_written += packet.data.len() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let Self {
            path,
            out,
            bytes_written,
        } = *self;
        let file = out
            .into_inner()
            .map_err(|e| CaptureError::WriterError(format!("{}: {}", path.display(), e)))?;
        file.sync_all()?;
        tracing::debug!("Finished {} ({} bytes)", path.display(), bytes_written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::CodecDescriptor;
    use bytes::Bytes;

    #[test]
    fn test_header_then_packets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.h264");
        let descriptors = CodecDescriptors::single(CodecDescriptor {
            codec: VideoCodec::H264,
            width: 1280,
            height: 720,
            framerate: Some(25),
            caps: None,
            header: Bytes::from_static(&[0, 0, 0, 1, 0x67]),
        });

        let mut muxer = Box::new(ElementaryMuxer::create(&path, &descriptors).unwrap());
        muxer
            .write_packet(&Packet {
                data: Bytes::from_static(&[0, 0, 0, 1, 0x65, 0xAA]),
                pts: None,
                duration: None,
                keyframe: true,
            })
            .unwrap();
        muxer.finish().unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, vec![0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x65, 0xAA]);
        assert_eq!(extension_for(&descriptors), "h264");
    }
}
