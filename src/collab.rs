//! External collaborators the streaming sessions depend on.
//!
//! Storage, remote video fetch, alert notification, and the processed
//! video registry are all capabilities behind traits; the binary wires in
//! concrete implementations, tests use the in-memory ones.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::PipelineError;

/// Blob storage for original and processed videos. Returns a URL the
/// client can fetch later.
pub trait ObjectStore: Send + Sync {
    fn upload(&self, name: &str, bytes: &[u8]) -> Result<String, PipelineError>;
    fn download(&self, name: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Resolves a remote video reference into its raw bytes.
pub trait VideoFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, PipelineError>;
}

/// A confirmed fire event worth telling someone about.
#[derive(Debug, Clone)]
pub struct FireAlert {
    pub video_title: String,
    pub detection_time: f64,
    pub original_url: String,
    pub processed_url: String,
    pub confidence: f64,
}

/// Delivery channel for confirmed fire alerts.
pub trait FireNotifier: Send + Sync {
    fn notify(&self, alert: &FireAlert) -> Result<(), PipelineError>;
}

/// Record of one finished processing run.
#[derive(Debug, Clone)]
pub struct ProcessedVideo {
    pub file_name: String,
    pub original_url: String,
    pub processed_url: String,
    pub fire_detected: bool,
    pub frames_processed: u64,
    pub fire_frame_ratio: f64,
    pub mean_confidence: f64,
}

/// Registry that keeps the outcome of completed runs.
pub trait CompletedVideoSink: Send + Sync {
    fn record(&self, video: &ProcessedVideo) -> Result<(), PipelineError>;
}

/// Keeps blobs in a process-local map; the default for tests and demo runs.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryStore {
    fn upload(&self, name: &str, bytes: &[u8]) -> Result<String, PipelineError> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| PipelineError::SourceUnavailable("store poisoned".into()))?;
        blobs.insert(name.to_string(), bytes.to_vec());
        info!(name, bytes = bytes.len(), "stored blob");
        Ok(format!("memory://{name}"))
    }

    fn download(&self, name: &str) -> Result<Vec<u8>, PipelineError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| PipelineError::SourceUnavailable("store poisoned".into()))?;
        blobs
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::SourceUnavailable(format!("no blob named {name}")))
    }
}

/// Fetches remote videos over plain HTTP(S).
pub struct HttpFetcher {
    agent: ureq::Agent,
    /// Refuse downloads larger than this many bytes.
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(std::time::Duration::from_secs(60))
                .build(),
            max_bytes,
        }
    }
}

impl VideoFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| PipelineError::SourceUnavailable(format!("fetch {url}: {e}")))?;
        read_limited(response.into_reader(), self.max_bytes)
    }
}

/// Read the whole stream, refusing anything larger than `max_bytes`.
/// A body of exactly `max_bytes` is accepted.
fn read_limited<R: Read>(reader: R, max_bytes: u64) -> Result<Vec<u8>, PipelineError> {
    let mut bytes = Vec::new();
    reader
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| PipelineError::SourceUnavailable(format!("fetch body: {e}")))?;
    if bytes.len() as u64 > max_bytes {
        return Err(PipelineError::SourceUnavailable(format!(
            "remote video exceeds {max_bytes} bytes"
        )));
    }
    Ok(bytes)
}

/// Notifier that only writes to the log. Stands in until a real channel
/// (mail, webhook) is configured.
#[derive(Default)]
pub struct LogNotifier;

impl FireNotifier for LogNotifier {
    fn notify(&self, alert: &FireAlert) -> Result<(), PipelineError> {
        warn!(
            video = %alert.video_title,
            at = alert.detection_time,
            confidence = alert.confidence,
            processed = %alert.processed_url,
            "fire confirmed"
        );
        Ok(())
    }
}

/// Registry that keeps completed runs in memory.
#[derive(Default)]
pub struct MemoryVideoSink {
    videos: Mutex<Vec<ProcessedVideo>>,
}

impl MemoryVideoSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ProcessedVideo> {
        self.videos
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl CompletedVideoSink for MemoryVideoSink {
    fn record(&self, video: &ProcessedVideo) -> Result<(), PipelineError> {
        let mut videos = self
            .videos
            .lock()
            .map_err(|_| PipelineError::SourceUnavailable("registry poisoned".into()))?;
        videos.push(video.clone());
        Ok(())
    }
}
