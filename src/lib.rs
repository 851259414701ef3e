pub mod collab;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod server;
pub mod source;

use std::path::PathBuf;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use engine::{BoundingBox, Detection, DetectionEngine};
pub use error::PipelineError;
pub use pipeline::{DetectionPipeline, FrameInfo, RenderedFrame};
pub use source::{Frame, FrameSource};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub render: RenderConfig,
    pub engine: EngineConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Camera device path for the live route
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Mirror live camera frames horizontally for display
    pub flip_horizontal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the inter-stage hand-off channels
    pub channel_capacity: usize,
    /// How often blocking receives wake up to check the stop flag
    pub poll_interval_ms: u64,
    /// Bounded wait when joining stage workers on shutdown
    pub join_timeout_ms: u64,
    /// Skip interval used before the timing window has warmed up
    pub initial_skip_interval: u32,
    /// Never skip more than (interval - 1) of every interval frames
    pub max_skip_interval: u32,
    /// Rolling sample count for inference latency
    pub timing_window: usize,
    /// No deliverable frame for this long is a fatal pipeline stall
    pub stall_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Frames a bounding box survives after its detection disappears
    pub box_hold_frames: u32,
    /// Frames a segmentation mask survives after its detection disappears
    pub mask_hold_frames: u32,
    /// Alpha for the blended mask overlay
    pub mask_alpha: f32,
    /// Alpha for the FPS badge background
    pub fps_badge_alpha: f32,
    /// TTF font for labels; boxes are drawn without text when unset
    pub font_path: Option<PathBuf>,
    /// JPEG quality for encoded output frames
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Detections below this confidence are discarded
    pub confidence_threshold: f32,
    /// Class index treated as fire
    pub fire_class_id: u32,
    /// Run one throwaway predict on the first frame
    pub warmup: bool,
    /// Reload attempts when the engine reports not ready
    pub reload_attempts: u32,
    pub reload_delay_ms: u64,
}

/// Wire format for annotated frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameEncoding {
    /// One binary message per frame, followed by its info event
    BinaryWithInfo,
    /// Frame bytes base64-embedded in the info event itself
    EmbeddedBase64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Bound on receiving a whole-file upload in one binary message
    pub upload_timeout_secs: u64,
    /// Emit a progress event every N processed frames
    pub progress_every: u64,
    /// Consecutive fire frames before the alert event fires
    pub alert_consecutive_frames: u32,
    /// Notification gating: minimum mean confidence across fire frames
    pub min_notify_confidence: f32,
    /// Notification gating: minimum share of frames containing fire
    pub min_fire_frame_ratio: f64,
    pub file_encoding: FrameEncoding,
    pub camera_encoding: FrameEncoding,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                device: "/dev/video0".into(),
                width: 800,
                height: 600,
                fps: 30,
                flip_horizontal: true,
            },
            pipeline: PipelineConfig {
                channel_capacity: 8,
                poll_interval_ms: 100,
                join_timeout_ms: 1000,
                initial_skip_interval: 2,
                max_skip_interval: 3,
                timing_window: 10,
                stall_timeout_secs: 10,
            },
            render: RenderConfig {
                box_hold_frames: 3,
                mask_hold_frames: 2,
                mask_alpha: 0.6,
                fps_badge_alpha: 0.25,
                font_path: None,
                jpeg_quality: 80,
            },
            engine: EngineConfig {
                confidence_threshold: 0.5,
                fire_class_id: 0,
                warmup: true,
                reload_attempts: 3,
                reload_delay_ms: 200,
            },
            server: ServerConfig {
                bind_addr: "0.0.0.0:8000".into(),
                upload_timeout_secs: 60,
                progress_every: 100,
                alert_consecutive_frames: 5,
                min_notify_confidence: 0.5,
                min_fire_frame_ratio: 0.01,
                file_encoding: FrameEncoding::BinaryWithInfo,
                camera_encoding: FrameEncoding::EmbeddedBase64,
            },
        }
    }
}
