//! Wire messages of the streaming protocol.
//!
//! Clients open a session with one JSON message choosing the mode, then
//! the server drives the exchange with `status` events. Field names are
//! part of the protocol and use the client's camelCase convention.

use serde::{Deserialize, Serialize};

use crate::pipeline::FrameInfo;

/// First message of a session, and per-chunk metadata afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declares a chunked upload.
    ChunkInfo {
        #[serde(rename = "totalChunks")]
        total_chunks: i64,
        #[serde(rename = "fileSize")]
        file_size: i64,
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Announces the chunk carried by the next binary message.
    ChunkMeta {
        #[serde(rename = "chunkIndex")]
        chunk_index: i64,
        #[serde(rename = "totalChunks")]
        total_chunks: i64,
        #[serde(rename = "chunkSize")]
        chunk_size: i64,
    },
    /// Declares a whole-file upload in a single binary message.
    Upload {
        #[serde(rename = "fileName")]
        file_name: String,
    },
    /// Asks the server to fetch a remote video.
    Youtube { youtube_url: String },
}

/// Server-to-client status events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Ready to receive the single binary upload message.
    Ready,
    /// Ready to receive the next chunk's binary message.
    ChunkReady,
    Receiving {
        percent: f64,
        #[serde(rename = "currentChunk")]
        current_chunk: usize,
        #[serde(rename = "totalChunks")]
        total_chunks: usize,
    },
    /// Whole upload is in hand, decoding starts.
    Received,
    Processing,
    Frame {
        #[serde(flatten)]
        info: FrameInfo,
        /// Base64 JPEG, present only in embedded-frame mode.
        #[serde(skip_serializing_if = "Option::is_none")]
        frame: Option<String>,
    },
    Progress {
        frames_processed: u64,
    },
    Alert {
        message: String,
        frame_index: u64,
        video_time: f64,
        /// Mean confidence over the fire frames seen so far.
        confidence: f64,
    },
    Completed {
        original_url: String,
        processed_url: String,
        fire_detected: bool,
        frames_processed: u64,
    },
    Error {
        message: String,
    },
    Info {
        message: String,
    },
}

impl StatusEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_info_uses_camel_case_fields() {
        let raw = r#"{"type":"chunk_info","totalChunks":4,"fileSize":1024,
                      "fileName":"clip.mp4","mimeType":"video/mp4"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::ChunkInfo {
                total_chunks,
                file_size,
                file_name,
                mime_type,
            } => {
                assert_eq!(total_chunks, 4);
                assert_eq!(file_size, 1024);
                assert_eq!(file_name, "clip.mp4");
                assert_eq!(mime_type, "video/mp4");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn chunk_meta_parses() {
        let raw = r#"{"type":"chunk_meta","chunkIndex":2,"totalChunks":4,"chunkSize":256}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::ChunkMeta {
                chunk_index: 2,
                total_chunks: 4,
                chunk_size: 256
            }
        ));
    }

    #[test]
    fn youtube_request_parses() {
        let raw = r#"{"type":"youtube","youtube_url":"https://example.com/v"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::Youtube { youtube_url } if youtube_url.ends_with("/v")));
    }

    #[test]
    fn status_tags_are_snake_case() {
        let json = serde_json::to_value(StatusEvent::ChunkReady).unwrap();
        assert_eq!(json["status"], "chunk_ready");

        let json = serde_json::to_value(StatusEvent::Receiving {
            percent: 50.0,
            current_chunk: 2,
            total_chunks: 4,
        })
        .unwrap();
        assert_eq!(json["status"], "receiving");
        assert_eq!(json["currentChunk"], 2);
        assert_eq!(json["totalChunks"], 4);
    }

    #[test]
    fn frame_event_flattens_info() {
        let event = StatusEvent::Frame {
            info: FrameInfo {
                frame_index: 7,
                video_time: 0.23,
                fire_detected: true,
                total_area_percent: 4.2,
                confidence: 0.9,
                fps: 24.0,
            },
            frame: None,
        };
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["status"], "frame");
        assert_eq!(json["frame_index"], 7);
        assert_eq!(json["fire_detected"], true);
        assert!(json.get("frame").is_none());
    }
}
