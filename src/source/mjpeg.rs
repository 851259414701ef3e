//! Motion-JPEG interchange format: an in-memory stream of concatenated
//! JPEG frames. This is the crate's native format for uploaded buffers and
//! for the annotated output artifact.

use image::RgbImage;
use jpeg_decoder::{Decoder, PixelFormat};
use tracing::debug;

use super::FrameSource;
use crate::error::PipelineError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Decode one JPEG image to RGB pixels.
pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage, PipelineError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| PipelineError::FrameReadFailure(format!("jpeg decode: {e}")))?;
    let info = decoder
        .info()
        .ok_or_else(|| PipelineError::FrameReadFailure("jpeg missing header info".into()))?;

    let (width, height) = (info.width as u32, info.height as u32);
    let rgb = match info.pixel_format {
        PixelFormat::RGB24 => pixels,
        // Grayscale: replicate luma into all three channels
        PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => {
            return Err(PipelineError::FrameReadFailure(format!(
                "unsupported jpeg pixel format: {other:?}"
            )))
        }
    };

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| PipelineError::FrameReadFailure("jpeg pixel buffer size mismatch".into()))
}

/// Byte ranges of each JPEG frame inside a concatenated buffer.
fn scan_frames(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 1 < buf.len() {
        let pair = [buf[i], buf[i + 1]];
        if pair == SOI && start.is_none() {
            start = Some(i);
            i += 2;
        } else if pair == EOI {
            if let Some(s) = start.take() {
                spans.push((s, i + 2));
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    spans
}

/// Frame source over an in-memory motion-JPEG buffer.
#[derive(Debug)]
pub struct MotionJpegSource {
    buf: Vec<u8>,
    spans: Vec<(usize, usize)>,
    cursor: usize,
    fps: f64,
    dimensions: (u32, u32),
}

impl MotionJpegSource {
    /// Scan the buffer for frames and probe the first one for geometry.
    pub fn from_bytes(buf: Vec<u8>, fps: f64) -> Result<Self, PipelineError> {
        let spans = scan_frames(&buf);
        if spans.is_empty() {
            return Err(PipelineError::SourceUnavailable(
                "no JPEG frames found in buffer".into(),
            ));
        }
        let (s, e) = spans[0];
        let first = decode_jpeg(&buf[s..e])
            .map_err(|e| PipelineError::SourceUnavailable(format!("first frame: {e}")))?;
        let dimensions = (first.width(), first.height());
        debug!(
            frames = spans.len(),
            width = dimensions.0,
            height = dimensions.1,
            "motion-jpeg buffer opened"
        );
        Ok(Self {
            buf,
            spans,
            cursor: 0,
            fps,
            dimensions,
        })
    }
}

impl FrameSource for MotionJpegSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, PipelineError> {
        let Some(&(s, e)) = self.spans.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        decode_jpeg(&self.buf[s..e]).map(Some)
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.spans.len() as u64)
    }
}

/// Receives every annotated frame the render stage produces.
pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), PipelineError>;

    /// Consume the sink and return the finished artifact bytes.
    fn finish(self: Box<Self>) -> Result<Vec<u8>, PipelineError>;
}

/// Encodes frames back into a concatenated-JPEG buffer, the same format
/// `MotionJpegSource` reads.
pub struct MjpegSink {
    out: Vec<u8>,
    quality: u8,
}

impl MjpegSink {
    pub fn new(quality: u8) -> Self {
        Self {
            out: Vec::new(),
            quality,
        }
    }
}

impl VideoSink for MjpegSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), PipelineError> {
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut self.out, self.quality);
        encoder
            .encode_image(frame)
            .map_err(|e| PipelineError::EncodingFailure(format!("jpeg encode: {e}")))
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, PipelineError> {
        Ok(self.out)
    }
}
