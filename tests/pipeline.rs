//! End-to-end pipeline runs over synthetic sources and scripted engines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ignis::engine::{BoundingBox, Detection, StubEngine};
use ignis::source::{FrameSource, MjpegSink, MotionJpegSource, SyntheticSource};
use ignis::{Config, DetectionPipeline};

fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.poll_interval_ms = 10;
    config.engine.warmup = false;
    config
}

fn fire_box() -> Detection {
    Detection::boxed(0, 0.9, BoundingBox::new(10.0, 10.0, 40.0, 40.0))
}

#[test]
fn fire_window_is_reported_with_holdover() {
    let config = test_config();
    // 4 seconds at 30fps; fire visible on frames 60..=90
    let source = Box::new(SyntheticSource::new(64, 64, 30.0, 120));
    let engine = Box::new(StubEngine::new().with_detections(vec![fire_box()], 60..=90));

    let pipeline = DetectionPipeline::spawn(source, engine, &config, None);
    let frames: Vec<_> = pipeline.frames().iter().collect();
    let _ = pipeline.finish();

    assert!(!frames.is_empty());
    for frame in &frames {
        let idx = frame.info.frame_index;
        // Boxes are held 3 frames past the last detection
        let expected = (60..=93).contains(&idx);
        assert_eq!(
            frame.info.fire_detected, expected,
            "frame {idx} fire_detected mismatch"
        );
        if expected {
            assert!(frame.info.confidence > 0.8);
        }
    }
}

#[test]
fn low_confidence_detections_are_ignored() {
    let config = test_config();
    let source = Box::new(SyntheticSource::new(64, 64, 30.0, 40));
    let weak = Detection::boxed(0, 0.3, BoundingBox::new(10.0, 10.0, 40.0, 40.0));
    let engine = Box::new(StubEngine::new().with_detections(vec![weak], 0..=u64::MAX));

    let pipeline = DetectionPipeline::spawn(source, engine, &config, None);
    let frames: Vec<_> = pipeline.frames().iter().collect();
    let _ = pipeline.finish();

    assert!(frames.iter().all(|f| !f.info.fire_detected));
}

#[test]
fn other_classes_are_not_fire() {
    let config = test_config();
    let source = Box::new(SyntheticSource::new(64, 64, 30.0, 40));
    let smoke = Detection::boxed(1, 0.95, BoundingBox::new(10.0, 10.0, 40.0, 40.0));
    let engine = Box::new(StubEngine::new().with_detections(vec![smoke], 0..=u64::MAX));

    let pipeline = DetectionPipeline::spawn(source, engine, &config, None);
    let frames: Vec<_> = pipeline.frames().iter().collect();
    let _ = pipeline.finish();

    assert!(frames.iter().all(|f| !f.info.fire_detected));
}

#[test]
fn cancel_stops_delivery_and_releases_the_source() {
    let config = test_config();
    let released = Arc::new(AtomicBool::new(false));
    let source = Box::new(
        SyntheticSource::new(64, 64, 30.0, u64::MAX)
            .paced()
            .with_release_probe(released.clone()),
    );
    let engine = Box::new(StubEngine::new());

    let pipeline = DetectionPipeline::spawn(source, engine, &config, None);
    for _ in 0..5 {
        pipeline.frames().recv().expect("live frame");
    }

    pipeline.cancel();
    let started = Instant::now();
    let artifact = pipeline.finish();
    assert!(artifact.is_none());
    // Cancellation is bounded, not best-effort
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn unavailable_engine_degrades_to_plain_frames() {
    let config = test_config();
    let source = Box::new(SyntheticSource::new(64, 64, 30.0, 15));
    let engine = Box::new(StubEngine::not_ready_for(u32::MAX));

    let pipeline = DetectionPipeline::spawn(source, engine, &config, None);
    let frames: Vec<_> = pipeline.frames().iter().collect();
    let _ = pipeline.finish();

    assert_eq!(frames.len(), 15);
    assert!(frames.iter().all(|f| !f.info.fire_detected));
    assert!(frames.iter().all(|f| f.info.confidence == 0.0));
}

#[test]
fn artifact_replays_with_source_frame_count() {
    let config = test_config();
    let source = Box::new(SyntheticSource::new(32, 32, 30.0, 18));
    let engine = Box::new(StubEngine::new().with_detections(vec![fire_box()], 4..=9));
    let sink = Box::new(MjpegSink::new(config.render.jpeg_quality));

    let pipeline = DetectionPipeline::spawn(source, engine, &config, Some(sink));
    let delivered = pipeline.frames().iter().count();
    let artifact = pipeline.finish().expect("artifact bytes");

    assert!(delivered > 0);
    let replay = MotionJpegSource::from_bytes(artifact, 30.0).expect("replayable artifact");
    // Skipped frames are still written, so the artifact keeps the source
    // timeline
    assert_eq!(replay.total_frames(), Some(18));
    assert_eq!(replay.dimensions(), (32, 32));
}

#[test]
fn slow_engine_skips_but_keeps_the_tail_intact() {
    let mut config = test_config();
    config.pipeline.initial_skip_interval = 0;
    // 25ms inference against a 100fps source
    let source = Box::new(SyntheticSource::new(32, 32, 100.0, 300));
    let engine = Box::new(StubEngine::new().with_latency(Duration::from_millis(25)));

    let pipeline = DetectionPipeline::spawn(source, engine, &config, None);
    let frames: Vec<_> = pipeline.frames().iter().collect();
    let _ = pipeline.finish();

    assert!(
        frames.len() < 300,
        "expected skipping, got all {} frames",
        frames.len()
    );
    // Every frame in the final second must have been delivered
    let tail: Vec<u64> = frames
        .iter()
        .map(|f| f.info.frame_index)
        .filter(|&i| i >= 200)
        .collect();
    assert_eq!(tail, (200u64..300).collect::<Vec<_>>());
}
