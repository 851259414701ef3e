//! WebSocket streaming sessions.
//!
//! A session owns everything for one client: the received video (or live
//! camera), one engine instance, one pipeline, and the delivery loop that
//! pushes annotated frames back over the socket.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine as _;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, StatusEvent};
use super::AppState;
use crate::collab::{FireAlert, ProcessedVideo};
use crate::engine::DetectionEngine;
use crate::error::PipelineError;
use crate::ingest::{ChunkReassembler, UploadDeclaration};
use crate::pipeline::{DetectionPipeline, RenderedFrame};
use crate::source::{FrameSource, MjpegSink, MotionJpegSource};
use crate::{Config, FrameEncoding};

/// Counters kept while frames are delivered; drives alerts, progress,
/// and the end-of-run notification gate.
#[derive(Default)]
struct DeliveryStats {
    frames: u64,
    fire_frames: u64,
    confidence_sum: f64,
    consecutive_fire: u32,
    alert_sent: bool,
    first_fire_time: Option<f64>,
}

impl DeliveryStats {
    fn observe(&mut self, frame: &RenderedFrame) {
        self.frames += 1;
        if frame.info.fire_detected {
            self.fire_frames += 1;
            self.confidence_sum += frame.info.confidence;
            self.consecutive_fire += 1;
            if self.first_fire_time.is_none() {
                self.first_fire_time = Some(frame.info.video_time);
            }
        } else {
            self.consecutive_fire = 0;
        }
    }

    fn fire_frame_ratio(&self) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        self.fire_frames as f64 / self.frames as f64
    }

    fn mean_confidence(&self) -> f64 {
        if self.fire_frames == 0 {
            return 0.0;
        }
        self.confidence_sum / self.fire_frames as f64
    }
}

enum DriveEnd {
    /// Source exhausted, all frames delivered.
    Finished,
    /// Client asked to stop or went away.
    Cancelled,
    /// No frame arrived within the stall timeout.
    Stalled,
}

/// Video-file session: receive the upload, run it through the pipeline,
/// stream annotated frames back, store and report the artifact.
pub async fn run_file_session(mut socket: WebSocket, state: AppState) {
    let config = state.config.clone();
    if let Err(e) = file_session(&mut socket, &state, &config).await {
        warn!("session ended with error: {e}");
        let _ = send_event(&mut socket, &StatusEvent::error(e.to_string())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn file_session(
    socket: &mut WebSocket,
    state: &AppState,
    config: &Config,
) -> Result<(), PipelineError> {
    let opening = recv_client_message(socket, config.server.upload_timeout_secs).await?;

    let (file_name, bytes) = match opening {
        ClientMessage::Upload { file_name } => {
            send_event(socket, &StatusEvent::Ready).await?;
            let bytes = recv_binary(socket, config.server.upload_timeout_secs).await?;
            (file_name, bytes)
        }
        ClientMessage::ChunkInfo {
            total_chunks,
            file_size,
            file_name,
            mime_type,
        } => {
            let declaration = UploadDeclaration {
                total_chunks,
                file_size,
                file_name: file_name.clone(),
                mime_type,
            };
            let bytes = receive_chunked(socket, config, declaration).await?;
            (file_name, bytes)
        }
        ClientMessage::Youtube { youtube_url } => {
            send_event(socket, &StatusEvent::info("fetching remote video")).await?;
            let fetcher = state.fetcher.clone();
            let url = youtube_url.clone();
            let bytes = tokio::task::spawn_blocking(move || fetcher.fetch(&url))
                .await
                .map_err(|_| PipelineError::SourceUnavailable("fetch task failed".into()))??;
            let name = youtube_url
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("remote")
                .to_string();
            (name, bytes)
        }
        ClientMessage::ChunkMeta { .. } => {
            return Err(PipelineError::ChunkProtocolViolation(
                "chunk metadata before declaration".into(),
            ))
        }
    };

    send_event(socket, &StatusEvent::Received).await?;
    info!(file = %file_name, bytes = bytes.len(), "upload complete");

    let original_url = state.store.upload(&file_name, &bytes)?;

    let mut engine = (state.engine_factory)();
    if !ensure_engine_ready(engine.as_mut(), config).await {
        return Err(PipelineError::EngineNotReady);
    }

    let source = open_source(bytes, config.capture.fps as f64)?;
    send_event(socket, &StatusEvent::Processing).await?;

    let sink = Box::new(MjpegSink::new(config.render.jpeg_quality));
    let pipeline = DetectionPipeline::spawn(source, engine, config, Some(sink));

    let mut stats = DeliveryStats::default();
    let end = drive(socket, &pipeline, config, config.server.file_encoding, &mut stats).await?;

    let artifact = tokio::task::spawn_blocking(move || pipeline.finish())
        .await
        .map_err(|_| PipelineError::TransportDisconnect)?;

    match end {
        DriveEnd::Finished => {
            let processed_name = processed_name(&file_name);
            let processed_url = match artifact {
                Some(bytes) => state.store.upload(&processed_name, &bytes)?,
                None => {
                    warn!("no artifact produced, reporting original only");
                    original_url.clone()
                }
            };
            send_event(
                socket,
                &StatusEvent::Completed {
                    original_url: original_url.clone(),
                    processed_url: processed_url.clone(),
                    fire_detected: stats.fire_frames > 0,
                    frames_processed: stats.frames,
                },
            )
            .await?;

            state.registry.record(&ProcessedVideo {
                file_name: file_name.clone(),
                original_url: original_url.clone(),
                processed_url: processed_url.clone(),
                fire_detected: stats.fire_frames > 0,
                frames_processed: stats.frames,
                fire_frame_ratio: stats.fire_frame_ratio(),
                mean_confidence: stats.mean_confidence(),
            })?;

            if stats.fire_frame_ratio() >= config.server.min_fire_frame_ratio
                && stats.mean_confidence() >= config.server.min_notify_confidence as f64
            {
                state.notifier.notify(&FireAlert {
                    video_title: file_name,
                    detection_time: stats.first_fire_time.unwrap_or(0.0),
                    original_url,
                    processed_url,
                    confidence: stats.mean_confidence(),
                })?;
            }
            Ok(())
        }
        DriveEnd::Cancelled => {
            debug!("session cancelled by client");
            Ok(())
        }
        DriveEnd::Stalled => Err(PipelineError::Stalled),
    }
}

/// Live-camera session: no upload, no artifact, frames embedded in the
/// info events.
pub async fn run_camera_session(mut socket: WebSocket, state: AppState) {
    let config = state.config.clone();
    if let Err(e) = camera_session(&mut socket, &state, &config).await {
        warn!("camera session ended with error: {e}");
        let _ = send_event(&mut socket, &StatusEvent::error(e.to_string())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn camera_session(
    socket: &mut WebSocket,
    state: &AppState,
    config: &Config,
) -> Result<(), PipelineError> {
    let mut engine = (state.engine_factory)();
    if !ensure_engine_ready(engine.as_mut(), config).await {
        return Err(PipelineError::EngineNotReady);
    }

    let capture = config.capture.clone();
    let source = tokio::task::spawn_blocking(move || crate::source::CameraSource::open(capture))
        .await
        .map_err(|_| PipelineError::SourceUnavailable("camera open task failed".into()))??;

    send_event(socket, &StatusEvent::Processing).await?;
    let pipeline = DetectionPipeline::spawn(Box::new(source), engine, config, None);

    let mut stats = DeliveryStats::default();
    let end = drive(
        socket,
        &pipeline,
        config,
        config.server.camera_encoding,
        &mut stats,
    )
    .await?;

    let _ = tokio::task::spawn_blocking(move || pipeline.finish()).await;
    match end {
        DriveEnd::Stalled => Err(PipelineError::Stalled),
        _ => {
            info!(frames = stats.frames, "camera session closed");
            Ok(())
        }
    }
}

/// Push annotated frames to the client until the stream ends, the client
/// stops the session, or the pipeline stalls.
async fn drive(
    socket: &mut WebSocket,
    pipeline: &DetectionPipeline,
    config: &Config,
    encoding: FrameEncoding,
    stats: &mut DeliveryStats,
) -> Result<DriveEnd, PipelineError> {
    let stall = Duration::from_secs(config.pipeline.stall_timeout_secs);
    let frames = pipeline.frames();

    enum Step {
        Incoming(Option<Result<Message, axum::Error>>),
        Frame(RenderedFrame),
        StreamEnd,
        Stall,
    }

    loop {
        // The socket is borrowed only while waiting; every send happens
        // after the select resolves.
        let step = tokio::select! {
            incoming = socket.recv() => Step::Incoming(incoming),
            next = tokio::time::timeout(stall, frames.recv_async()) => match next {
                Ok(Ok(frame)) => Step::Frame(frame),
                Ok(Err(_)) => Step::StreamEnd,
                Err(_) => Step::Stall,
            },
        };

        match step {
            Step::Incoming(incoming) => match incoming {
                Some(Ok(Message::Text(text))) if text.trim().eq_ignore_ascii_case("stop") => {
                    pipeline.cancel();
                    return Ok(DriveEnd::Cancelled);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    pipeline.cancel();
                    return Ok(DriveEnd::Cancelled);
                }
                Some(Ok(_)) => continue,
            },
            Step::Frame(frame) => {
                stats.observe(&frame);
                let (frame_index, video_time) = (frame.info.frame_index, frame.info.video_time);
                if let Err(e) = deliver_frame(socket, frame, encoding, config.render.jpeg_quality).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    // Encoding failure: this frame is dropped, the stream
                    // goes on
                    warn!(frame_index, "frame dropped: {e}");
                    continue;
                }

                if !stats.alert_sent
                    && stats.consecutive_fire >= config.server.alert_consecutive_frames
                {
                    stats.alert_sent = true;
                    send_event(
                        socket,
                        &StatusEvent::Alert {
                            message: "sustained fire detected".into(),
                            frame_index,
                            video_time,
                            confidence: stats.mean_confidence(),
                        },
                    )
                    .await?;
                }
                if stats.frames % config.server.progress_every == 0 {
                    send_event(
                        socket,
                        &StatusEvent::Progress {
                            frames_processed: stats.frames,
                        },
                    )
                    .await?;
                }
            }
            Step::StreamEnd => return Ok(DriveEnd::Finished),
            Step::Stall => {
                pipeline.cancel();
                return Ok(DriveEnd::Stalled);
            }
        }
    }
}

async fn deliver_frame(
    socket: &mut WebSocket,
    frame: RenderedFrame,
    encoding: FrameEncoding,
    quality: u8,
) -> Result<(), PipelineError> {
    let jpeg = encode_jpeg(&frame.pixels, quality)?;
    match encoding {
        FrameEncoding::BinaryWithInfo => {
            socket
                .send(Message::Binary(jpeg))
                .await
                .map_err(|_| PipelineError::TransportDisconnect)?;
            send_event(
                socket,
                &StatusEvent::Frame {
                    info: frame.info,
                    frame: None,
                },
            )
            .await
        }
        FrameEncoding::EmbeddedBase64 => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&jpeg);
            send_event(
                socket,
                &StatusEvent::Frame {
                    info: frame.info,
                    frame: Some(encoded),
                },
            )
            .await
        }
    }
}

/// Chunked upload loop: a chunk_ready handshake before each chunk, a
/// receiving report after it.
async fn receive_chunked(
    socket: &mut WebSocket,
    config: &Config,
    declaration: UploadDeclaration,
) -> Result<Vec<u8>, PipelineError> {
    let timeout = config.server.upload_timeout_secs;
    let mut reassembler = ChunkReassembler::new();
    reassembler.declare(declaration)?;

    while !reassembler.is_complete() {
        send_event(socket, &StatusEvent::ChunkReady).await?;

        let meta = recv_client_message(socket, timeout).await?;
        let ClientMessage::ChunkMeta { chunk_index, .. } = meta else {
            return Err(PipelineError::ChunkProtocolViolation(
                "expected chunk metadata".into(),
            ));
        };
        reassembler.expect_chunk(chunk_index)?;

        let payload = recv_binary(socket, timeout).await?;
        let progress = reassembler.receive(payload.into())?;
        send_event(
            socket,
            &StatusEvent::Receiving {
                percent: progress.percent,
                current_chunk: progress.received,
                total_chunks: progress.total,
            },
        )
        .await?;
    }

    reassembler.assemble()
}

/// Bounded engine readiness: a few reload attempts, then give up.
async fn ensure_engine_ready(engine: &mut dyn DetectionEngine, config: &Config) -> bool {
    if engine.is_ready() {
        return true;
    }
    for attempt in 1..=config.engine.reload_attempts {
        warn!(attempt, "engine not ready, reloading");
        if engine.reload().is_ok() && engine.is_ready() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(config.engine.reload_delay_ms)).await;
    }
    engine.is_ready()
}

fn open_source(bytes: Vec<u8>, fallback_fps: f64) -> Result<Box<dyn FrameSource>, PipelineError> {
    #[cfg(feature = "gstreamer-decode")]
    {
        match crate::source::gst::GstFileSource::from_bytes(&bytes) {
            Ok(source) => return Ok(Box::new(source)),
            Err(e) => debug!("container decode unavailable, trying motion-jpeg: {e}"),
        }
    }
    Ok(Box::new(MotionJpegSource::from_bytes(bytes, fallback_fps)?))
}

fn processed_name(original: &str) -> String {
    let stem = original.rsplit_once('.').map(|(s, _)| s).unwrap_or(original);
    format!("{stem}_processed.mjpeg")
}

fn encode_jpeg(pixels: &image::RgbImage, quality: u8) -> Result<Vec<u8>, PipelineError> {
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(pixels)
        .map_err(|e| PipelineError::EncodingFailure(format!("jpeg encode: {e}")))?;
    Ok(out)
}

async fn send_event(socket: &mut WebSocket, event: &StatusEvent) -> Result<(), PipelineError> {
    let json = serde_json::to_string(event)
        .map_err(|e| PipelineError::EncodingFailure(format!("event encode: {e}")))?;
    socket
        .send(Message::Text(json))
        .await
        .map_err(|_| PipelineError::TransportDisconnect)
}

async fn recv_client_message(
    socket: &mut WebSocket,
    timeout_secs: u64,
) -> Result<ClientMessage, PipelineError> {
    let text = recv_text(socket, timeout_secs).await?;
    serde_json::from_str(&text)
        .map_err(|e| PipelineError::ChunkProtocolViolation(format!("bad client message: {e}")))
}

async fn recv_text(socket: &mut WebSocket, timeout_secs: u64) -> Result<String, PipelineError> {
    let deadline = Duration::from_secs(timeout_secs);
    loop {
        let message = tokio::time::timeout(deadline, socket.recv())
            .await
            .map_err(|_| PipelineError::TransportDisconnect)?
            .ok_or(PipelineError::TransportDisconnect)?
            .map_err(|_| PipelineError::TransportDisconnect)?;
        match message {
            Message::Text(text) => return Ok(text),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Err(PipelineError::TransportDisconnect),
            Message::Binary(_) => {
                return Err(PipelineError::ChunkProtocolViolation(
                    "unexpected binary message".into(),
                ))
            }
        }
    }
}

async fn recv_binary(socket: &mut WebSocket, timeout_secs: u64) -> Result<Vec<u8>, PipelineError> {
    let deadline = Duration::from_secs(timeout_secs);
    loop {
        let message = tokio::time::timeout(deadline, socket.recv())
            .await
            .map_err(|_| PipelineError::TransportDisconnect)?
            .ok_or(PipelineError::TransportDisconnect)?
            .map_err(|_| PipelineError::TransportDisconnect)?;
        match message {
            Message::Binary(bytes) => return Ok(bytes),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Err(PipelineError::TransportDisconnect),
            Message::Text(_) => {
                return Err(PipelineError::ChunkProtocolViolation(
                    "expected binary payload".into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_gate_matches_ratio_and_confidence() {
        let mut stats = DeliveryStats::default();
        for i in 0..100u64 {
            let fire = i < 2;
            stats.observe(&RenderedFrame {
                pixels: image::RgbImage::new(1, 1),
                info: crate::pipeline::FrameInfo {
                    frame_index: i,
                    video_time: i as f64 / 30.0,
                    fire_detected: fire,
                    total_area_percent: 0.0,
                    confidence: if fire { 0.8 } else { 0.0 },
                    fps: 30.0,
                },
            });
        }
        assert!((stats.fire_frame_ratio() - 0.02).abs() < 1e-9);
        assert!((stats.mean_confidence() - 0.8).abs() < 1e-9);
        assert_eq!(stats.first_fire_time, Some(0.0));
    }

    #[test]
    fn consecutive_counter_resets_on_clear_frame() {
        let mut stats = DeliveryStats::default();
        let frame = |i: u64, fire: bool| RenderedFrame {
            pixels: image::RgbImage::new(1, 1),
            info: crate::pipeline::FrameInfo {
                frame_index: i,
                video_time: 0.0,
                fire_detected: fire,
                total_area_percent: 0.0,
                confidence: 0.9,
                fps: 0.0,
            },
        };
        stats.observe(&frame(0, true));
        stats.observe(&frame(1, true));
        stats.observe(&frame(2, false));
        stats.observe(&frame(3, true));
        assert_eq!(stats.consecutive_fire, 1);
    }

    #[test]
    fn processed_name_replaces_extension() {
        assert_eq!(processed_name("clip.mp4"), "clip_processed.mjpeg");
        assert_eq!(processed_name("noext"), "noext_processed.mjpeg");
    }

    #[tokio::test]
    async fn engine_recovering_within_reload_budget_is_accepted() {
        let mut config = Config::default();
        config.engine.reload_delay_ms = 1;
        let mut engine = crate::engine::StubEngine::not_ready_for(2);
        assert!(ensure_engine_ready(&mut engine, &config).await);
    }

    #[tokio::test]
    async fn engine_that_never_recovers_is_refused() {
        let mut config = Config::default();
        config.engine.reload_delay_ms = 1;
        let mut engine = crate::engine::StubEngine::not_ready_for(u32::MAX);
        assert!(!ensure_engine_ready(&mut engine, &config).await);
    }
}
