//! Generated frames for tests and scenario runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};

use super::FrameSource;
use crate::error::PipelineError;

/// Fixed-rate source producing `total` flat-colored frames.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    fps: f64,
    total: u64,
    produced: u64,
    /// Sleep one frame duration per read to behave like a live device.
    paced: bool,
    released: Option<Arc<AtomicBool>>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: f64, total: u64) -> Self {
        Self {
            width,
            height,
            fps,
            total,
            produced: 0,
            paced: false,
            released: None,
        }
    }

    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    /// Flag set when the source is dropped; stands in for a device handle
    /// release in shutdown tests.
    pub fn with_release_probe(mut self, flag: Arc<AtomicBool>) -> Self {
        self.released = Some(flag);
        self
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, PipelineError> {
        if self.produced >= self.total {
            return Ok(None);
        }
        if self.paced {
            std::thread::sleep(Duration::from_secs_f64(1.0 / self.fps));
        }
        // Vary the shade so consecutive frames differ
        let shade = (self.produced % 251) as u8;
        let frame = RgbImage::from_pixel(self.width, self.height, Rgb([shade, shade, 32]));
        self.produced += 1;
        Ok(Some(frame))
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.total)
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        if let Some(flag) = &self.released {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_total() {
        let mut source = SyntheticSource::new(4, 4, 30.0, 2);
        assert!(source.read_frame().unwrap().is_some());
        assert!(source.read_frame().unwrap().is_some());
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn release_probe_fires_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let source = SyntheticSource::new(4, 4, 30.0, 1).with_release_probe(flag.clone());
        drop(source);
        assert!(flag.load(Ordering::SeqCst));
    }
}
