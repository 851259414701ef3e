//! Chunk protocol driven the way a client would, JSON messages included.

use bytes::Bytes;
use ignis::ingest::{ChunkReassembler, UploadDeclaration};
use ignis::server::ClientMessage;
use ignis::PipelineError;

fn declare_from_json(r: &mut ChunkReassembler, json: &str) -> Result<(), PipelineError> {
    let msg: ClientMessage = serde_json::from_str(json).expect("valid json");
    match msg {
        ClientMessage::ChunkInfo {
            total_chunks,
            file_size,
            file_name,
            mime_type,
        } => r.declare(UploadDeclaration {
            total_chunks,
            file_size,
            file_name,
            mime_type,
        }),
        other => panic!("expected chunk_info, got {other:?}"),
    }
}

fn meta_from_json(r: &mut ChunkReassembler, json: &str) -> Result<(), PipelineError> {
    let msg: ClientMessage = serde_json::from_str(json).expect("valid json");
    match msg {
        ClientMessage::ChunkMeta { chunk_index, .. } => r.expect_chunk(chunk_index),
        other => panic!("expected chunk_meta, got {other:?}"),
    }
}

#[test]
fn out_of_order_upload_reassembles_byte_identical() {
    let payload: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
    let chunks: Vec<&[u8]> = payload.chunks(256).collect();
    assert_eq!(chunks.len(), 4);

    let mut r = ChunkReassembler::new();
    declare_from_json(
        &mut r,
        &format!(
            r#"{{"type":"chunk_info","totalChunks":4,"fileSize":{},
                "fileName":"clip.mp4","mimeType":"video/mp4"}}"#,
            payload.len()
        ),
    )
    .unwrap();

    for index in [3usize, 1, 0, 2] {
        meta_from_json(
            &mut r,
            &format!(
                r#"{{"type":"chunk_meta","chunkIndex":{index},"totalChunks":4,"chunkSize":{}}}"#,
                chunks[index].len()
            ),
        )
        .unwrap();
        r.receive(Bytes::copy_from_slice(chunks[index])).unwrap();
    }

    assert!(r.is_complete());
    assert_eq!(r.assemble().unwrap(), payload);
}

#[test]
fn progress_percent_tracks_unique_chunks() {
    let mut r = ChunkReassembler::new();
    r.declare(UploadDeclaration {
        total_chunks: 4,
        file_size: 8,
        file_name: "clip.mp4".into(),
        mime_type: "video/mp4".into(),
    })
    .unwrap();

    r.expect_chunk(0).unwrap();
    let p = r.receive(Bytes::from(vec![1, 2])).unwrap();
    assert_eq!(p.received, 1);
    assert!((p.percent - 25.0).abs() < 1e-9);

    // Re-sending the same chunk does not move progress
    r.expect_chunk(0).unwrap();
    let p = r.receive(Bytes::from(vec![1, 2])).unwrap();
    assert_eq!(p.received, 1);

    r.expect_chunk(3).unwrap();
    let p = r.receive(Bytes::from(vec![7, 8])).unwrap();
    assert!((p.percent - 50.0).abs() < 1e-9);
}

#[test]
fn violations_abort_the_whole_upload() {
    // Index out of range
    let mut r = ChunkReassembler::new();
    declare_from_json(
        &mut r,
        r#"{"type":"chunk_info","totalChunks":2,"fileSize":10,
            "fileName":"a.mp4","mimeType":"video/mp4"}"#,
    )
    .unwrap();
    assert!(matches!(
        meta_from_json(
            &mut r,
            r#"{"type":"chunk_meta","chunkIndex":2,"totalChunks":2,"chunkSize":5}"#
        ),
        Err(PipelineError::ChunkProtocolViolation(_))
    ));
    // Nothing works after the abort, even a valid chunk
    assert!(r.expect_chunk(0).is_err());
    assert!(r.assemble().is_err());

    // Declaration with nonsense counts
    let mut r = ChunkReassembler::new();
    assert!(declare_from_json(
        &mut r,
        r#"{"type":"chunk_info","totalChunks":-1,"fileSize":10,
            "fileName":"a.mp4","mimeType":"video/mp4"}"#,
    )
    .is_err());

    // Payload with no metadata announcement
    let mut r = ChunkReassembler::new();
    declare_from_json(
        &mut r,
        r#"{"type":"chunk_info","totalChunks":2,"fileSize":10,
            "fileName":"a.mp4","mimeType":"video/mp4"}"#,
    )
    .unwrap();
    assert!(r.receive(Bytes::from(vec![1, 2, 3])).is_err());
}
