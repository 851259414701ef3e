//! Detection engine seam.
//!
//! The model itself (weights, architecture, runtime) is an external
//! capability. The pipeline only needs `predict` on a frame, a readiness
//! probe, and a reload hook for the session's bounded retry policy.

use std::sync::Arc;
use std::time::Duration;

use ndarray::Array2;

use crate::error::PipelineError;
use crate::source::Frame;

/// Axis-aligned box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Integer geometry key used by the temporal cache.
    pub fn geometry_key(&self) -> (i32, i32, i32, i32) {
        (
            self.x1 as i32,
            self.y1 as i32,
            self.x2 as i32,
            self.y2 as i32,
        )
    }
}

/// One detection produced by the engine for a frame. Immutable once made.
#[derive(Debug, Clone)]
pub struct Detection {
    pub class_id: u32,
    /// In [0, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Segmentation mask at frame resolution; values > 0.5 are covered.
    pub mask: Option<Array2<f32>>,
}

impl Detection {
    pub fn boxed(class_id: u32, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            confidence,
            bbox,
            mask: None,
        }
    }
}

/// Narrow contract the pipeline holds against the model.
///
/// Implementations must be `Send`: each session owns one engine instance
/// and moves it onto the inference worker. There is no process-wide shared
/// model.
pub trait DetectionEngine: Send {
    /// True when the model is loaded and `predict` may be called.
    fn is_ready(&self) -> bool;

    /// Attempt to (re)load the model. Called a bounded number of times by
    /// the session before it gives up with a terminal error.
    fn reload(&mut self) -> Result<(), PipelineError>;

    /// Run detection on one frame.
    fn predict(&mut self, frame: &Frame) -> Result<Vec<Detection>, PipelineError>;
}

/// Factory injected into the server; one engine per session.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn DetectionEngine> + Send + Sync>;

/// Scripted engine for tests and the demo configuration.
///
/// Returns the configured detections for frames whose sequence index falls
/// inside `active`, nothing otherwise, and sleeps `latency` per call to
/// exercise the adaptive skip controller.
pub struct StubEngine {
    detections: Vec<Detection>,
    active: std::ops::RangeInclusive<u64>,
    latency: Duration,
    ready: bool,
    reloads_until_ready: u32,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            detections: Vec::new(),
            active: 0..=u64::MAX,
            latency: Duration::ZERO,
            ready: true,
            reloads_until_ready: 0,
        }
    }

    /// Engine that reports not-ready and recovers after `n` reloads.
    /// `n == u32::MAX` never recovers.
    pub fn not_ready_for(n: u32) -> Self {
        Self {
            ready: false,
            reloads_until_ready: n,
            ..Self::new()
        }
    }

    pub fn with_detections(
        mut self,
        detections: Vec<Detection>,
        active: std::ops::RangeInclusive<u64>,
    ) -> Self {
        self.detections = detections;
        self.active = active;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionEngine for StubEngine {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn reload(&mut self) -> Result<(), PipelineError> {
        if self.reloads_until_ready == u32::MAX {
            return Err(PipelineError::EngineNotReady);
        }
        if self.reloads_until_ready > 0 {
            self.reloads_until_ready -= 1;
        }
        if self.reloads_until_ready == 0 {
            self.ready = true;
        }
        Ok(())
    }

    fn predict(&mut self, frame: &Frame) -> Result<Vec<Detection>, PipelineError> {
        if !self.ready {
            return Err(PipelineError::EngineNotReady);
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if self.active.contains(&frame.sequence) {
            Ok(self.detections.clone())
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Frame;

    fn blank_frame(sequence: u64) -> Frame {
        Frame::new(image::RgbImage::new(8, 8), sequence)
    }

    #[test]
    fn stub_respects_active_range() {
        let det = Detection::boxed(0, 0.9, BoundingBox::new(1.0, 1.0, 5.0, 5.0));
        let mut engine = StubEngine::new().with_detections(vec![det], 3..=5);

        assert!(engine.predict(&blank_frame(2)).unwrap().is_empty());
        assert_eq!(engine.predict(&blank_frame(3)).unwrap().len(), 1);
        assert_eq!(engine.predict(&blank_frame(5)).unwrap().len(), 1);
        assert!(engine.predict(&blank_frame(6)).unwrap().is_empty());
    }

    #[test]
    fn stub_recovers_after_reloads() {
        let mut engine = StubEngine::not_ready_for(2);
        assert!(!engine.is_ready());
        engine.reload().unwrap();
        assert!(!engine.is_ready());
        engine.reload().unwrap();
        assert!(engine.is_ready());
    }

    #[test]
    fn geometry_key_truncates_to_pixels() {
        let bbox = BoundingBox::new(1.9, 2.1, 10.5, 20.7);
        assert_eq!(bbox.geometry_key(), (1, 2, 10, 20));
    }
}
