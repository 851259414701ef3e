//! V4L2 camera source for the live route.

use image::RgbImage;
use tracing::info;
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::mjpeg::decode_jpeg;
use super::FrameSource;
use crate::error::PipelineError;
use crate::CaptureConfig;

const BUFFER_COUNT: u32 = 4;

/// Live MJPEG capture from a V4L2 device.
///
/// The device handle lives exactly as long as this source; dropping it on
/// any pipeline exit path releases the camera.
pub struct CameraSource {
    stream: MmapStream<'static>,
    _device: Box<Device>,
    config: CaptureConfig,
    dimensions: (u32, u32),
}

impl CameraSource {
    pub fn open(config: CaptureConfig) -> Result<Self, PipelineError> {
        info!(device = %config.device, "opening camera");

        let device = Box::new(
            Device::with_path(&config.device)
                .map_err(|e| PipelineError::SourceUnavailable(format!("open camera: {e}")))?,
        );

        let caps = device
            .query_caps()
            .map_err(|e| PipelineError::SourceUnavailable(format!("query caps: {e}")))?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(PipelineError::SourceUnavailable(
                "device doesn't support video capture".into(),
            ));
        }
        info!("camera: {} ({})", caps.card, caps.driver);

        let mut fmt = device
            .format()
            .map_err(|e| PipelineError::SourceUnavailable(format!("read format: {e}")))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(b"MJPG");
        let fmt = device
            .set_format(&fmt)
            .map_err(|e| PipelineError::SourceUnavailable(format!("set format: {e}")))?;
        if fmt.fourcc != FourCC::new(b"MJPG") {
            return Err(PipelineError::SourceUnavailable(
                "device doesn't provide MJPEG".into(),
            ));
        }
        let dimensions = (fmt.width, fmt.height);

        // The stream keeps its own handle to the device internally, so it
        // is not tied to our borrow of `device`.
        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| PipelineError::SourceUnavailable(format!("start stream: {e}")))?;

        Ok(Self {
            stream,
            _device: device,
            config,
            dimensions,
        })
    }
}

impl FrameSource for CameraSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, PipelineError> {
        let (buf, _meta) = self
            .stream
            .next()
            .map_err(|e| PipelineError::FrameReadFailure(format!("camera dequeue: {e}")))?;
        let mut frame = decode_jpeg(buf)?;
        if self.config.flip_horizontal {
            frame = image::imageops::flip_horizontal(&frame);
        }
        Ok(Some(frame))
    }

    fn fps(&self) -> f64 {
        self.config.fps as f64
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn total_frames(&self) -> Option<u64> {
        None
    }
}
