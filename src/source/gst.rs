//! GStreamer-backed decode for arbitrary containers (mp4, webm, ...).
//!
//! Enabled with the `gstreamer-decode` feature; the default build handles
//! motion-JPEG buffers only.

use std::path::{Path, PathBuf};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use image::RgbImage;
use tracing::{debug, info};

use super::FrameSource;
use crate::error::PipelineError;

/// Decodes a video file into RGB frames through an appsink.
pub struct GstFileSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    fps: f64,
    dimensions: (u32, u32),
    total: Option<u64>,
    /// First frame pulled while probing caps, served on the first read.
    pending: Option<RgbImage>,
    /// Staged temp file to remove on drop, when opened from bytes.
    staged: Option<PathBuf>,
}

impl GstFileSource {
    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        gst::init()
            .map_err(|e| PipelineError::SourceUnavailable(format!("gstreamer init: {e}")))?;

        let pipeline_str = format!(
            "filesrc location={} ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false",
            path.display()
        );
        info!("decode pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| PipelineError::SourceUnavailable(format!("parse pipeline: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::SourceUnavailable("not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| PipelineError::SourceUnavailable("appsink not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::SourceUnavailable("appsink cast failed".into()))?;
        appsink.set_property("max-buffers", 3u32);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::SourceUnavailable(format!("start pipeline: {e}")))?;

        // Pull the first sample to learn the negotiated geometry and rate
        let sample = appsink
            .pull_sample()
            .map_err(|_| PipelineError::SourceUnavailable("no decodable frames".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| PipelineError::SourceUnavailable("sample without caps".into()))?;
        let s = caps
            .structure(0)
            .ok_or_else(|| PipelineError::SourceUnavailable("caps without structure".into()))?;
        let width = s.get::<i32>("width").unwrap_or(0) as u32;
        let height = s.get::<i32>("height").unwrap_or(0) as u32;
        let fps = s
            .get::<gst::Fraction>("framerate")
            .map(|f| f.numer() as f64 / f.denom().max(1) as f64)
            .unwrap_or(30.0);

        let total = pipeline
            .query_duration::<gst::ClockTime>()
            .map(|d| (d.seconds() as f64 * fps).round() as u64);

        debug!(width, height, fps, ?total, "container opened");

        let mut source = Self {
            pipeline,
            appsink,
            fps,
            dimensions: (width, height),
            total,
            pending: None,
            staged: None,
        };
        // The probe sample is the first frame; keep it for the first read
        source.pending = Some(Self::sample_to_image(&sample, width, height)?);
        Ok(source)
    }

    /// Stage an in-memory buffer to a temp file and decode it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PipelineError> {
        let path = std::env::temp_dir().join(format!(
            "ignis-upload-{}-{}.bin",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ));
        std::fs::write(&path, bytes)
            .map_err(|e| PipelineError::SourceUnavailable(format!("stage upload: {e}")))?;
        let mut source = Self::from_path(&path)?;
        source.staged = Some(path);
        Ok(source)
    }

    fn sample_to_image(
        sample: &gst::Sample,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, PipelineError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| PipelineError::FrameReadFailure("sample without buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| PipelineError::FrameReadFailure("buffer map failed".into()))?;
        RgbImage::from_raw(width, height, map.as_slice().to_vec())
            .ok_or_else(|| PipelineError::FrameReadFailure("frame size mismatch".into()))
    }
}

impl FrameSource for GstFileSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, PipelineError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        if self.appsink.is_eos() {
            return Ok(None);
        }
        match self.appsink.pull_sample() {
            Ok(sample) => {
                let (w, h) = self.dimensions;
                Self::sample_to_image(&sample, w, h).map(Some)
            }
            // pull_sample errors at EOS or on a flushing pipeline
            Err(_) => Ok(None),
        }
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn total_frames(&self) -> Option<u64> {
        self.total
    }
}

impl Drop for GstFileSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
        if let Some(path) = self.staged.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
