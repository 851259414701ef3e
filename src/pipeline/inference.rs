//! Adaptive inference stage: decides per frame whether to run detection,
//! feeds the timing window, and republishes frames downstream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use super::capture::send_polled;
use super::skip::SkipController;
use crate::engine::{Detection, DetectionEngine};
use crate::source::Frame;

/// What the inference stage hands to the render stage.
///
/// `detections` is `None` when inference did not run for this frame
/// (skipped, or the engine briefly unavailable); `Some(vec![])` means
/// inference ran and found nothing.
pub(crate) struct InferencedFrame {
    pub frame: Frame,
    pub detections: Option<Vec<Detection>>,
    pub skipped: bool,
}

pub(crate) fn run_inference(
    rx: Receiver<Frame>,
    tx: Sender<InferencedFrame>,
    mut engine: Box<dyn DetectionEngine>,
    mut controller: SkipController,
    stop: Arc<AtomicBool>,
    poll: Duration,
    warmup: bool,
) {
    let mut warmup_pending = warmup;

    loop {
        if stop.load(Ordering::Relaxed) {
            debug!("inference: stop observed");
            break;
        }
        let frame = match rx.recv_timeout(poll) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if warmup_pending && engine.is_ready() {
            // One throwaway predict so the first measured latency isn't
            // inflated by lazy model initialization
            let _ = engine.predict(&frame);
            warmup_pending = false;
        }

        if controller.should_skip(frame.sequence) {
            metrics::counter!("frames_skipped").increment(1);
            let out = InferencedFrame {
                frame,
                detections: None,
                skipped: true,
            };
            if !send_polled(&tx, out, &stop, poll) {
                break;
            }
            continue;
        }

        let start = Instant::now();
        let detections = match engine.predict(&frame) {
            Ok(detections) => {
                let elapsed = start.elapsed();
                controller.record(elapsed);
                metrics::histogram!("inference_latency_ms").record(elapsed.as_secs_f64() * 1000.0);
                Some(detections)
            }
            Err(e) => {
                // Recoverable: this frame goes through without results
                warn!(sequence = frame.sequence, "inference failed: {e}");
                None
            }
        };

        let out = InferencedFrame {
            frame,
            detections,
            skipped: false,
        };
        if !send_polled(&tx, out, &stop, poll) {
            break;
        }
    }
}
