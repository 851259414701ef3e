//! Three-stage detection pipeline.
//!
//! capture -> inference -> render, one worker thread per stage, joined by
//! bounded channels. Producers block when a channel is full, so a slow
//! consumer throttles the whole chain instead of growing a queue.
//!
//! Shutdown is cooperative: one stop flag shared by all three workers,
//! checked on every channel wait. Joins are bounded; a worker that fails
//! to exit in time is reported and abandoned rather than waited on
//! forever.

mod capture;
mod inference;
mod overlay;
mod render;
mod skip;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::Receiver;
use tracing::{info, warn};

pub use render::{FrameInfo, RenderedFrame};
pub use skip::{InferenceTimingWindow, SkipController};

use crate::engine::DetectionEngine;
use crate::source::{FrameSource, VideoSink};
use crate::Config;

pub struct DetectionPipeline {
    stop: Arc<AtomicBool>,
    frames: Receiver<RenderedFrame>,
    source_fps: f64,
    capture_worker: Option<JoinHandle<()>>,
    inference_worker: Option<JoinHandle<()>>,
    render_worker: Option<JoinHandle<Option<Vec<u8>>>>,
    join_timeout: Duration,
}

impl DetectionPipeline {
    /// Start the stage workers over `source` and `engine`. When `sink` is
    /// given, every frame (skipped ones included) is also written to it
    /// and the encoded artifact comes back from [`finish`].
    ///
    /// [`finish`]: DetectionPipeline::finish
    pub fn spawn(
        source: Box<dyn FrameSource>,
        engine: Box<dyn DetectionEngine>,
        config: &Config,
        sink: Option<Box<dyn VideoSink>>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let poll = Duration::from_millis(config.pipeline.poll_interval_ms);
        let capacity = config.pipeline.channel_capacity;

        let source_fps = source.fps();
        let total_frames = source.total_frames();
        let controller = SkipController::new(
            config.pipeline.timing_window,
            config.pipeline.initial_skip_interval,
            config.pipeline.max_skip_interval,
            source_fps,
            total_frames,
        );

        let (frame_tx, frame_rx) = flume::bounded(capacity);
        let (inferred_tx, inferred_rx) = flume::bounded(capacity);
        let (rendered_tx, rendered_rx) = flume::bounded(capacity);

        info!(
            fps = source_fps,
            total = ?total_frames,
            capacity,
            "pipeline starting"
        );

        let capture_worker = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("capture".into())
                .spawn(move || capture::run_capture(source, frame_tx, stop, poll))
        };
        let inference_worker = {
            let stop = stop.clone();
            let warmup = config.engine.warmup;
            std::thread::Builder::new()
                .name("inference".into())
                .spawn(move || {
                    inference::run_inference(
                        frame_rx,
                        inferred_tx,
                        engine,
                        controller,
                        stop,
                        poll,
                        warmup,
                    )
                })
        };
        let render_worker = {
            let stop = stop.clone();
            let render_cfg = config.render.clone();
            let engine_cfg = config.engine.clone();
            std::thread::Builder::new().name("render".into()).spawn(move || {
                render::run_render(
                    inferred_rx,
                    rendered_tx,
                    render_cfg,
                    engine_cfg,
                    source_fps,
                    stop,
                    poll,
                    sink,
                )
            })
        };

        Self {
            stop,
            frames: rendered_rx,
            source_fps,
            // Builder::spawn only fails when the OS refuses a thread; the
            // corresponding stage then never produces and the pipeline
            // drains empty.
            capture_worker: capture_worker.ok(),
            inference_worker: inference_worker.ok(),
            render_worker: render_worker.ok(),
            join_timeout: Duration::from_millis(config.pipeline.join_timeout_ms),
        }
    }

    /// Receiver for delivered frames. Disconnects when the source is
    /// exhausted or the pipeline is cancelled.
    pub fn frames(&self) -> &Receiver<RenderedFrame> {
        &self.frames
    }

    pub fn source_fps(&self) -> f64 {
        self.source_fps
    }

    /// Request cooperative shutdown. Idempotent; workers notice within one
    /// poll interval.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop the workers and collect the encoded artifact, if a sink was
    /// attached. Waits at most the configured join timeout per worker.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        self.cancel();

        join_bounded(self.capture_worker.take(), "capture", self.join_timeout);
        join_bounded(self.inference_worker.take(), "inference", self.join_timeout);

        let handle = self.render_worker.take()?;
        let deadline = Instant::now() + self.join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("render worker did not stop in time, abandoning");
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        match handle.join() {
            Ok(artifact) => artifact,
            Err(_) => {
                warn!("render worker panicked");
                None
            }
        }
    }
}

impl Drop for DetectionPipeline {
    fn drop(&mut self) {
        self.cancel();
        join_bounded(self.capture_worker.take(), "capture", self.join_timeout);
        join_bounded(self.inference_worker.take(), "inference", self.join_timeout);
        if let Some(handle) = self.render_worker.take() {
            let deadline = Instant::now() + self.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("render worker did not stop in time, abandoning");
            }
        }
    }
}

fn join_bounded(handle: Option<JoinHandle<()>>, stage: &str, timeout: Duration) {
    let Some(handle) = handle else { return };
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(stage, "worker did not stop in time, abandoning");
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        warn!(stage, "worker panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BoundingBox, Detection, StubEngine};
    use crate::source::{FrameSource, MjpegSink, MotionJpegSource, SyntheticSource};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.pipeline.poll_interval_ms = 10;
        config.engine.warmup = false;
        config
    }

    #[test]
    fn delivers_all_frames_from_fast_engine() {
        let config = test_config();
        let source = Box::new(SyntheticSource::new(16, 16, 30.0, 25));
        let det = Detection::boxed(0, 0.9, BoundingBox::new(2.0, 2.0, 10.0, 10.0));
        let engine = Box::new(StubEngine::new().with_detections(vec![det], 5..=10));

        let pipeline = DetectionPipeline::spawn(source, engine, &config, None);
        let frames: Vec<_> = pipeline.frames().iter().collect();

        assert_eq!(frames.len(), 25);
        assert!(frames.iter().all(|f| f.info.video_time >= 0.0));
        assert!(frames[7].info.fire_detected);
        assert!(!frames[0].info.fire_detected);
        assert!(pipeline.finish().is_none());
    }

    #[test]
    fn artifact_holds_every_source_frame() {
        let config = test_config();
        let source = Box::new(SyntheticSource::new(16, 16, 30.0, 12));
        let engine = Box::new(StubEngine::new());
        let sink = Box::new(MjpegSink::new(config.render.jpeg_quality));

        let pipeline = DetectionPipeline::spawn(source, engine, &config, Some(sink));
        for _ in pipeline.frames().iter() {}
        let artifact = pipeline.finish().expect("artifact");

        let replay = MotionJpegSource::from_bytes(artifact, 30.0).expect("replayable artifact");
        assert_eq!(replay.total_frames(), Some(12));
    }

    #[test]
    fn cancel_releases_source_and_stops_delivery() {
        let config = test_config();
        let released = Arc::new(AtomicBool::new(false));
        let source = Box::new(
            SyntheticSource::new(16, 16, 30.0, u64::MAX)
                .paced()
                .with_release_probe(released.clone()),
        );
        let engine = Box::new(StubEngine::new());

        let pipeline = DetectionPipeline::spawn(source, engine, &config, None);
        let _ = pipeline.frames().recv().unwrap();
        pipeline.cancel();
        let _ = pipeline.finish();

        assert!(released.load(Ordering::SeqCst));
    }
}
