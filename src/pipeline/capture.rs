//! Capture stage: pulls frames from the source as fast as it can and tags
//! them with a gap-free, strictly increasing sequence index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{SendTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::source::{Frame, FrameSource};

/// Blocking send that stays responsive to the stop flag.
///
/// Returns false when the worker should exit (stopped or receiver gone).
pub(crate) fn send_polled<T>(
    tx: &Sender<T>,
    mut value: T,
    stop: &AtomicBool,
    poll: Duration,
) -> bool {
    loop {
        match tx.send_timeout(value, poll) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(v)) => {
                if stop.load(Ordering::Relaxed) {
                    return false;
                }
                value = v;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Capture worker body. Owns the source handle; the handle is released
/// when this function returns, on every exit path.
pub(crate) fn run_capture(
    mut source: Box<dyn FrameSource>,
    tx: Sender<Frame>,
    stop: Arc<AtomicBool>,
    poll: Duration,
) {
    let mut sequence: u64 = 0;
    loop {
        if stop.load(Ordering::Relaxed) {
            debug!("capture: stop observed");
            break;
        }
        match source.read_frame() {
            Ok(Some(pixels)) => {
                let frame = Frame::new(pixels, sequence);
                sequence += 1;
                metrics::counter!("frames_captured").increment(1);
                if !send_polled(&tx, frame, &stop, poll) {
                    break;
                }
            }
            Ok(None) => {
                info!(frames = sequence, "capture: source exhausted");
                break;
            }
            Err(e) => {
                // A single bad read is treated as end of stream
                warn!("capture: read failed, ending stream: {e}");
                break;
            }
        }
    }
    // Dropping the sender signals completion downstream; dropping the
    // source releases the device/file handle.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SyntheticSource;

    #[test]
    fn sequence_is_strictly_increasing_without_gaps() {
        let source = Box::new(SyntheticSource::new(4, 4, 30.0, 50));
        let (tx, rx) = flume::bounded(8);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            std::thread::spawn(move || run_capture(source, tx, stop, Duration::from_millis(10)))
        };

        let mut expected = 0u64;
        while let Ok(frame) = rx.recv() {
            assert_eq!(frame.sequence, expected);
            expected += 1;
        }
        assert_eq!(expected, 50);
        worker.join().unwrap();
    }

    #[test]
    fn stop_flag_halts_capture_promptly() {
        let source = Box::new(SyntheticSource::new(4, 4, 30.0, u64::MAX).paced());
        let (tx, rx) = flume::bounded(2);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            std::thread::spawn(move || run_capture(source, tx, stop, Duration::from_millis(10)))
        };

        let _ = rx.recv().unwrap();
        stop.store(true, Ordering::Relaxed);
        drop(rx);
        worker.join().unwrap();
    }
}
