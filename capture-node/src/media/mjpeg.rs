//! Motion JPEG over HTTP: `multipart/x-mixed-replace` or bare concatenated
//! JPEGs. Each JPEG becomes one keyframe packet.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use image::ImageFormat;
use std::io::Cursor;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{CodecDescriptor, CodecDescriptors, Demuxer, Packet, Unit, VideoCodec};
use crate::error::{CaptureError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub struct MjpegDemuxer {
    client: reqwest::Client,
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    buffer: BytesMut,
    pending: Option<Bytes>,
    started: Option<Instant>,
}

impl MjpegDemuxer {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            body: None,
            buffer: BytesMut::new(),
            pending: None,
            started: None,
        }
    }

    async fn next_jpeg(&mut self) -> Result<Bytes> {
        loop {
            if let Some(jpeg) = extract_jpeg(&mut self.buffer)? {
                return Ok(jpeg);
            }

            let body = self
                .body
                .as_mut()
                .ok_or_else(|| CaptureError::InvalidState("demuxer is not open".to_string()))?;

            match body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(CaptureError::ReadError(e.to_string())),
                None => return Err(CaptureError::EndOfStream),
            }
        }
    }

    fn packet(&self, data: Bytes) -> Unit {
        Unit::Packet(Packet {
            data,
            pts: self.started.map(|started| started.elapsed()),
            duration: None,
            keyframe: true,
        })
    }
}

impl Default for MjpegDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Demuxer for MjpegDemuxer {
    async fn open(&mut self, url: &str) -> Result<CodecDescriptors> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CaptureError::SourceUnavailable(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(CaptureError::SourceUnavailable(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }

        self.body = Some(response.bytes_stream().boxed());

        let first = match tokio::time::timeout(PROBE_TIMEOUT, self.next_jpeg()).await {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                return Err(CaptureError::SourceUnavailable(format!("{}: {}", url, e)));
            }
            Err(_) => {
                return Err(CaptureError::SourceUnavailable(format!(
                    "{}: no JPEG within {:?}",
                    url, PROBE_TIMEOUT
                )));
            }
        };

        let (width, height) = image::io::Reader::with_format(Cursor::new(&first), ImageFormat::Jpeg)
            .into_dimensions()
            .map_err(|e| CaptureError::SourceUnavailable(format!("{}: undecodable JPEG: {}", url, e)))?;

        info!("MJPEG source {} is {}x{}", url, width, height);
        self.pending = Some(first);
        self.started = Some(Instant::now());

        Ok(CodecDescriptors::single(CodecDescriptor {
            codec: VideoCodec::Mjpeg,
            width,
            height,
            framerate: None,
            caps: None,
            header: Bytes::new(),
        }))
    }

    async fn read_unit(&mut self) -> Result<Unit> {
        if let Some(first) = self.pending.take() {
            return Ok(self.packet(first));
        }
        let jpeg = self.next_jpeg().await?;
        Ok(self.packet(jpeg))
    }

    async fn close(&mut self) -> Result<()> {
        if self.body.take().is_some() {
            debug!("MJPEG connection released");
        }
        self.buffer.clear();
        self.pending = None;
        Ok(())
    }
}

/// Takes the first complete JPEG (SOI through matching EOI) off the front of
/// `buffer`. Bytes before the SOI marker, such as multipart headers, are
/// discarded. Embedded thumbnails are skipped by tracking marker depth.
pub(crate) fn extract_jpeg(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    let Some(start) = buffer.windows(2).position(|w| w == [0xFF, 0xD8]) else {
        // Keep a trailing 0xFF, it may be the first half of the next SOI.
        let keep = usize::from(buffer.last() == Some(&0xFF));
        let len = buffer.len();
        buffer.advance(len - keep);
        return Ok(None);
    };
    buffer.advance(start);

    let mut depth = 0usize;
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == 0xFF {
            match buffer[i + 1] {
                0xD8 => {
                    depth += 1;
                    i += 2;
                    continue;
                }
                0xD9 => {
                    depth = depth.saturating_sub(1);
                    i += 2;
                    if depth == 0 {
                        return Ok(Some(buffer.split_to(i).freeze()));
                    }
                    continue;
                }
                _ => {}
            }
        }
        i += 1;
    }

    if buffer.len() > MAX_FRAME_BYTES {
        buffer.clear();
        return Err(CaptureError::ReadError(format!(
            "no end of image within {} bytes",
            MAX_FRAME_BYTES
        )));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::ColorType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![128u8; (width * height * 3) as usize];
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 80)
            .encode(&pixels, width, height, ColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn test_extract_skips_multipart_headers() {
        let image = jpeg(16, 16);
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        buffer.extend_from_slice(&image);
        buffer.extend_from_slice(b"\r\n--frame\r\n");

        let found = extract_jpeg(&mut buffer).unwrap().unwrap();

        assert_eq!(&found[..], &image[..]);
        assert_eq!(&buffer[..], b"\r\n--frame\r\n");
    }

    #[test]
    fn test_extract_handles_embedded_thumbnail() {
        let mut data = vec![0xFF, 0xD8, 0x01, 0x02];
        data.extend_from_slice(&[0xFF, 0xD8, 0x03, 0xFF, 0xD9]);
        data.extend_from_slice(&[0x04, 0xFF, 0xD9]);
        let mut buffer = BytesMut::from(&data[..]);

        let found = extract_jpeg(&mut buffer).unwrap().unwrap();

        assert_eq!(found.len(), data.len());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_extract_waits_for_more_data() {
        let image = jpeg(16, 16);
        let mut buffer = BytesMut::from(&image[..image.len() - 1]);
        assert!(extract_jpeg(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&image[image.len() - 1..]);
        assert!(extract_jpeg(&mut buffer).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_demuxer_reads_multipart_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frame = jpeg(64, 48);

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
                      Connection: close\r\n\r\n",
                )
                .await
                .unwrap();
            for _ in 0..3 {
                socket
                    .write_all(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n")
                    .await
                    .unwrap();
                socket.write_all(&frame).await.unwrap();
                socket.write_all(b"\r\n").await.unwrap();
            }
            socket.shutdown().await.unwrap();
        });

        let mut demuxer = MjpegDemuxer::new();
        let descriptors = demuxer
            .open(&format!("http://{}/video.mjpg", addr))
            .await
            .unwrap();
        let video = descriptors.video().unwrap();
        assert_eq!((video.width, video.height), (64, 48));
        assert_eq!(video.codec, VideoCodec::Mjpeg);

        let mut packets = 0;
        loop {
            match demuxer.read_unit().await {
                Ok(Unit::Packet(packet)) => {
                    assert!(packet.keyframe);
                    packets += 1;
                }
                Ok(Unit::Frame(_)) => panic!("MJPEG demuxer emits packets only"),
                Err(CaptureError::EndOfStream) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(packets, 3);

        demuxer.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_unreachable_source() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut demuxer = MjpegDemuxer::new();
        let result = demuxer.open(&format!("http://{}/video.mjpg", addr)).await;

        assert!(matches!(result, Err(CaptureError::SourceUnavailable(_))));
    }
}
