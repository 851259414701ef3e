//! Render stage: temporal smoothing of detections, annotation drawing,
//! and delivery of finished frames.
//!
//! The stage sees every frame the inference stage forwards, including the
//! skipped ones. Skipped frames still age the temporal caches and still go
//! into the output artifact so its timeline matches the source, but only
//! frames that actually ran inference are handed to the session.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, warn};

use super::capture::send_polled;
use super::inference::InferencedFrame;
use super::overlay::Overlay;
use crate::engine::Detection;
use crate::source::VideoSink;
use crate::{EngineConfig, RenderConfig};

/// Per-frame metadata delivered alongside the annotated image.
#[derive(Debug, Clone, Serialize)]
pub struct FrameInfo {
    pub frame_index: u64,
    /// Position in the source timeline, seconds.
    pub video_time: f64,
    pub fire_detected: bool,
    /// Share of the frame covered by fresh detections, percent.
    pub total_area_percent: f64,
    /// Mean confidence over currently visible boxes, 0 when none.
    pub confidence: f64,
    /// Measured delivery rate, 0 on the first frame.
    pub fps: f64,
}

/// An annotated frame ready for encoding and transport.
pub struct RenderedFrame {
    pub pixels: image::RgbImage,
    pub info: FrameInfo,
}

struct BoxEntry {
    confidence: f32,
    remaining: u32,
    fresh: bool,
}

struct MaskEntry {
    mask: Array2<f32>,
    remaining: u32,
    fresh: bool,
}

/// Holds recent detections over the frames where inference was skipped or
/// came back empty, so annotations do not flicker at skip boundaries.
///
/// Boxes are keyed by integer pixel geometry, masks by content hash. A
/// detection seen again resets its countdown; an entry last seen with
/// hold N stays drawn for N more frames, then drops out.
pub(crate) struct TemporalCache {
    boxes: HashMap<(i32, i32, i32, i32), BoxEntry>,
    masks: HashMap<u64, MaskEntry>,
    box_hold: u32,
    mask_hold: u32,
}

impl TemporalCache {
    pub fn new(box_hold: u32, mask_hold: u32) -> Self {
        Self {
            boxes: HashMap::new(),
            masks: HashMap::new(),
            box_hold,
            mask_hold,
        }
    }

    /// Advance the cache by one frame. `fresh` holds this frame's accepted
    /// fire detections, or `None` when inference did not run.
    pub fn advance(&mut self, fresh: Option<&[&Detection]>) {
        for entry in self.boxes.values_mut() {
            entry.fresh = false;
        }
        for entry in self.masks.values_mut() {
            entry.fresh = false;
        }

        if let Some(detections) = fresh {
            for det in detections {
                let entry = self
                    .boxes
                    .entry(det.bbox.geometry_key())
                    .or_insert(BoxEntry {
                        confidence: det.confidence,
                        remaining: self.box_hold,
                        fresh: true,
                    });
                entry.confidence = det.confidence;
                entry.remaining = self.box_hold;
                entry.fresh = true;

                if let Some(mask) = &det.mask {
                    let entry = self.masks.entry(mask_key(mask)).or_insert(MaskEntry {
                        mask: mask.clone(),
                        remaining: self.mask_hold,
                        fresh: true,
                    });
                    entry.remaining = self.mask_hold;
                    entry.fresh = true;
                }
            }
        }

        // An entry last seen with hold N is drawn for N more frames; it
        // leaves the map on the frame after its countdown hits zero.
        self.boxes.retain(|_, entry| {
            if entry.fresh {
                return true;
            }
            if entry.remaining == 0 {
                return false;
            }
            entry.remaining -= 1;
            true
        });
        self.masks.retain(|_, entry| {
            if entry.fresh {
                return true;
            }
            if entry.remaining == 0 {
                return false;
            }
            entry.remaining -= 1;
            true
        });
    }

    pub fn fire_visible(&self) -> bool {
        !self.boxes.is_empty()
    }

    /// Mean confidence across visible boxes, fresh and held alike.
    pub fn mean_confidence(&self) -> f64 {
        if self.boxes.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.boxes.values().map(|e| e.confidence as f64).sum();
        sum / self.boxes.len() as f64
    }

    fn draw(&self, canvas: &mut image::RgbImage, overlay: &Overlay) {
        for entry in self.masks.values() {
            overlay.blend_mask(canvas, &entry.mask);
        }
        for (key, entry) in &self.boxes {
            let bbox = crate::engine::BoundingBox::new(
                key.0 as f32,
                key.1 as f32,
                key.2 as f32,
                key.3 as f32,
            );
            let alpha = if entry.fresh {
                1.0
            } else {
                0.6 + 0.4 * entry.remaining as f32 / self.box_hold as f32
            };
            overlay.draw_box(canvas, &bbox, entry.confidence, alpha);
        }
    }
}

fn mask_key(mask: &Array2<f32>) -> u64 {
    let mut hasher = DefaultHasher::new();
    mask.dim().hash(&mut hasher);
    for value in mask.iter() {
        value.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Wall-clock rate of delivered frames. The first tick has no baseline and
/// reports 0.
pub(crate) struct FpsTracker {
    last: Option<Instant>,
}

impl FpsTracker {
    pub fn new() -> Self {
        Self { last: None }
    }

    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let fps = match self.last {
            Some(prev) => {
                let dt = now.duration_since(prev).as_secs_f64();
                if dt > 0.0 {
                    1.0 / dt
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some(now);
        fps
    }
}

/// Share of the frame covered by this frame's accepted detections. Only
/// mask pixels count; a box without a mask contributes no area, since box
/// extents overstate the burning region.
fn fresh_area_percent(detections: &[&Detection], width: u32, height: u32) -> f64 {
    let frame_area = (width as f64) * (height as f64);
    if frame_area == 0.0 {
        return 0.0;
    }
    let covered: f64 = detections
        .iter()
        .filter_map(|det| det.mask.as_ref())
        .map(|mask| mask.iter().filter(|v| **v > 0.5).count() as f64)
        .sum();
    (covered / frame_area * 100.0).min(100.0)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn run_render(
    rx: Receiver<InferencedFrame>,
    tx: Sender<RenderedFrame>,
    render_cfg: RenderConfig,
    engine_cfg: EngineConfig,
    source_fps: f64,
    stop: Arc<AtomicBool>,
    poll: Duration,
    mut sink: Option<Box<dyn VideoSink>>,
) -> Option<Vec<u8>> {
    let overlay = Overlay::new(&render_cfg);
    let mut cache = TemporalCache::new(render_cfg.box_hold_frames, render_cfg.mask_hold_frames);
    let mut fps = FpsTracker::new();
    let fps_divisor = source_fps.max(1.0);

    loop {
        if stop.load(Ordering::Relaxed) {
            debug!("render: stop observed");
            break;
        }
        let input = match rx.recv_timeout(poll) {
            Ok(input) => input,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let accepted: Option<Vec<&Detection>> = input.detections.as_ref().map(|dets| {
            dets.iter()
                .filter(|d| {
                    d.class_id == engine_cfg.fire_class_id
                        && d.confidence >= engine_cfg.confidence_threshold
                })
                .collect()
        });
        cache.advance(accepted.as_deref());

        let mut pixels = input.frame.pixels;
        cache.draw(&mut pixels, &overlay);

        if input.skipped {
            if let Some(sink) = sink.as_mut() {
                if let Err(e) = sink.write_frame(&pixels) {
                    warn!("render: artifact write failed: {e}");
                }
            }
            continue;
        }

        let rate = fps.tick();
        overlay.draw_fps_badge(&mut pixels, rate);

        if let Some(sink) = sink.as_mut() {
            if let Err(e) = sink.write_frame(&pixels) {
                warn!("render: artifact write failed: {e}");
            }
        }

        let area = accepted
            .as_deref()
            .map(|dets| fresh_area_percent(dets, pixels.width(), pixels.height()))
            .unwrap_or(0.0);
        let info = FrameInfo {
            frame_index: input.frame.sequence,
            video_time: input.frame.sequence as f64 / fps_divisor,
            fire_detected: cache.fire_visible(),
            total_area_percent: area,
            confidence: cache.mean_confidence(),
            fps: rate,
        };
        metrics::counter!("frames_rendered").increment(1);
        if !send_polled(&tx, RenderedFrame { pixels, info }, &stop, poll) {
            break;
        }
    }

    match sink.map(|s| s.finish()) {
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(e)) => {
            warn!("render: artifact finalize failed: {e}");
            None
        }
        None => None,
    }
}
