//! Adaptive frame-skip control.
//!
//! Inference is usually slower than the source frame rate. The controller
//! keeps a small rolling window of recent inference latencies and derives a
//! skip interval that bounds inference throughput to real time, capped so
//! no more than 2 of every 3 frames are ever skipped.

use std::collections::VecDeque;
use std::time::Duration;

/// Fixed-capacity FIFO of recent inference durations.
#[derive(Debug)]
pub struct InferenceTimingWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl InferenceTimingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Window is warm once it has filled to capacity.
    pub fn is_warm(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

/// Per-stage skip state; owned by the inference worker.
#[derive(Debug)]
pub struct SkipController {
    window: InferenceTimingWindow,
    /// 0 means no skipping; N means only frames with `seq % N == 0` run.
    interval: u32,
    max_interval: u32,
    frame_duration: Duration,
    source_fps: f64,
    total_frames: Option<u64>,
}

impl SkipController {
    pub fn new(
        window_capacity: usize,
        initial_interval: u32,
        max_interval: u32,
        source_fps: f64,
        total_frames: Option<u64>,
    ) -> Self {
        Self {
            window: InferenceTimingWindow::new(window_capacity),
            interval: initial_interval,
            max_interval,
            frame_duration: Duration::from_secs_f64(1.0 / source_fps.max(1.0)),
            source_fps,
            total_frames,
        }
    }

    /// Decide whether to skip inference for this frame.
    ///
    /// The last second of a finite source always runs full-quality
    /// inference regardless of the current interval.
    pub fn should_skip(&self, sequence: u64) -> bool {
        if let Some(total) = self.total_frames {
            let frames_left = total.saturating_sub(sequence);
            if frames_left <= self.source_fps as u64 {
                return false;
            }
        }
        self.interval > 0 && sequence % self.interval as u64 != 0
    }

    /// Record one inference latency and, once warm, retune the interval.
    pub fn record(&mut self, elapsed: Duration) {
        self.window.push(elapsed);
        if !self.window.is_warm() {
            return;
        }
        let avg = self.window.average().unwrap_or_default();
        self.interval = if avg > self.frame_duration {
            let ratio = avg.as_secs_f64() / self.frame_duration.as_secs_f64();
            (ratio.ceil() as u32).min(self.max_interval)
        } else {
            0
        };
    }

    pub fn current_interval(&self) -> u32 {
        self.interval
    }
}
