pub mod camera;
#[cfg(feature = "gstreamer-decode")]
pub mod gst;
pub mod mjpeg;
pub mod synthetic;

use std::time::Instant;

use image::RgbImage;

use crate::error::PipelineError;

pub use camera::CameraSource;
pub use mjpeg::{MjpegSink, MotionJpegSource, VideoSink};
pub use synthetic::SyntheticSource;

/// One frame of pixel data moving through the pipeline.
///
/// Exclusively owned by whichever stage currently holds it; ownership
/// transfers along the hand-off channels, never shared.
pub struct Frame {
    pub pixels: RgbImage,
    /// Monotonically increasing from 0, unique per session. Assigned by
    /// the capture stage.
    pub sequence: u64,
    pub capture_time: Instant,
}

impl Frame {
    pub fn new(pixels: RgbImage, sequence: u64) -> Self {
        Self {
            pixels,
            sequence,
            capture_time: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Where frames come from: a decoded upload, a remote download, or a
/// live camera. Reports its native rate and geometry up front.
pub trait FrameSource: Send {
    /// Pull the next decoded frame. `Ok(None)` is normal end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, PipelineError>;

    /// Native frame rate of the source.
    fn fps(&self) -> f64;

    /// (width, height) of decoded frames.
    fn dimensions(&self) -> (u32, u32);

    /// Total frame count when known; `None` for live sources.
    fn total_frames(&self) -> Option<u64>;
}
