//! Pipeline error taxonomy.
//!
//! Stage-local recoverable conditions (one skipped or failed frame) never
//! abort the pipeline; source- and protocol-level failures abort the whole
//! session after releasing owned resources.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Cannot open the device, file, or URL. Fatal; the session ends.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Model not loaded. Recoverable via bounded reload attempts.
    #[error("detection engine not ready")]
    EngineNotReady,

    /// One bad read from the source. Treated as end of stream, not retried.
    #[error("frame read failed: {0}")]
    FrameReadFailure(String),

    /// Bad chunk index, size, or ordering. Fatal for that upload.
    #[error("chunk protocol violation: {0}")]
    ChunkProtocolViolation(String),

    /// Client gone. Not an error; triggers the graceful-stop cleanup path.
    #[error("transport disconnected")]
    TransportDisconnect,

    /// Per-frame draw or encode error. Logged; the frame is dropped.
    #[error("frame encoding failed: {0}")]
    EncodingFailure(String),

    /// No frame emerged for a long multiple of the frame duration.
    #[error("pipeline stalled")]
    Stalled,
}

impl PipelineError {
    /// True when the condition aborts the whole session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::EngineNotReady | PipelineError::EncodingFailure(_)
        )
    }
}
