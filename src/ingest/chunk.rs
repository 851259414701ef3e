//! Chunked upload reassembly.
//!
//! Large uploads arrive as a declaration followed by interleaved metadata
//! and binary messages. Chunks may arrive out of order; each carries its
//! index, and the reassembler only hands the buffer back once every index
//! in `[0, total)` is present.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use crate::error::PipelineError;

/// Opening message of a chunked upload.
#[derive(Debug, Clone)]
pub struct UploadDeclaration {
    pub total_chunks: i64,
    pub file_size: i64,
    pub file_name: String,
    pub mime_type: String,
}

/// Receipt state reported after each accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkProgress {
    pub received: usize,
    pub total: usize,
    pub percent: f64,
}

enum State {
    Idle,
    AwaitingChunks {
        declaration: UploadDeclaration,
        chunks: HashMap<usize, Bytes>,
        next_index: Option<usize>,
    },
    Complete,
    Aborted,
}

/// Collects the chunks of one upload and produces the original buffer.
///
/// Any protocol violation is terminal: the reassembler aborts and every
/// later call fails, so a confused peer cannot half-deliver a file.
pub struct ChunkReassembler {
    state: State,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Accept the upload declaration. Must come before any chunk.
    pub fn declare(&mut self, declaration: UploadDeclaration) -> Result<(), PipelineError> {
        if !matches!(self.state, State::Idle) {
            return Err(self.abort("declaration repeated or out of order"));
        }
        if declaration.total_chunks <= 0 || declaration.file_size <= 0 {
            return Err(self.abort(&format!(
                "invalid declaration: {} chunks, {} bytes",
                declaration.total_chunks, declaration.file_size
            )));
        }
        debug!(
            file = %declaration.file_name,
            chunks = declaration.total_chunks,
            bytes = declaration.file_size,
            "upload declared"
        );
        self.state = State::AwaitingChunks {
            declaration,
            chunks: HashMap::new(),
            next_index: None,
        };
        Ok(())
    }

    /// Announce the chunk the next binary message carries.
    pub fn expect_chunk(&mut self, index: i64) -> Result<(), PipelineError> {
        let total = match &self.state {
            State::AwaitingChunks { declaration, .. } => declaration.total_chunks,
            _ => return Err(self.abort("chunk metadata before declaration")),
        };
        if index < 0 || index >= total {
            return Err(self.abort(&format!("chunk index {index} outside 0..{total}")));
        }
        match &mut self.state {
            State::AwaitingChunks { next_index, .. } => *next_index = Some(index as usize),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Store the binary payload for the most recently announced chunk.
    /// A duplicate index overwrites the previous payload without
    /// advancing the received count.
    pub fn receive(&mut self, payload: Bytes) -> Result<ChunkProgress, PipelineError> {
        let State::AwaitingChunks {
            declaration,
            chunks,
            next_index,
        } = &mut self.state
        else {
            return Err(self.abort("binary chunk before declaration"));
        };
        let Some(index) = next_index.take() else {
            return Err(self.abort("binary chunk without preceding metadata"));
        };

        chunks.insert(index, payload);
        let total = declaration.total_chunks as usize;
        let received = chunks.len();
        Ok(ChunkProgress {
            received,
            total,
            percent: received as f64 / total as f64 * 100.0,
        })
    }

    pub fn is_complete(&self) -> bool {
        match &self.state {
            State::AwaitingChunks {
                declaration,
                chunks,
                ..
            } => chunks.len() == declaration.total_chunks as usize,
            _ => false,
        }
    }

    /// Concatenate the chunks in index order. Fails if any index is
    /// missing.
    pub fn assemble(&mut self) -> Result<Vec<u8>, PipelineError> {
        let State::AwaitingChunks {
            declaration,
            chunks,
            ..
        } = &mut self.state
        else {
            return Err(self.abort("assemble before any chunks"));
        };

        let total = declaration.total_chunks as usize;
        // Capacity comes from what actually arrived; the declared size is
        // peer-controlled and must not drive allocation.
        let mut out = Vec::with_capacity(chunks.values().map(Bytes::len).sum());
        for index in 0..total {
            match chunks.remove(&index) {
                Some(chunk) => out.extend_from_slice(&chunk),
                None => {
                    let message = format!("chunk {index} of {total} never arrived");
                    self.state = State::Aborted;
                    return Err(PipelineError::ChunkProtocolViolation(message));
                }
            }
        }
        self.state = State::Complete;
        Ok(out)
    }

    fn abort(&mut self, reason: &str) -> PipelineError {
        self.state = State::Aborted;
        PipelineError::ChunkProtocolViolation(reason.into())
    }
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declaration(total_chunks: i64, file_size: i64) -> UploadDeclaration {
        UploadDeclaration {
            total_chunks,
            file_size,
            file_name: "clip.mp4".into(),
            mime_type: "video/mp4".into(),
        }
    }

    #[test]
    fn out_of_order_chunks_reassemble_byte_identical() {
        let parts: Vec<Vec<u8>> = vec![
            vec![0, 1, 2],
            vec![3, 4],
            vec![5],
            vec![6, 7, 8, 9],
            vec![10],
        ];
        let expected: Vec<u8> = parts.iter().flatten().copied().collect();

        let mut r = ChunkReassembler::new();
        r.declare(declaration(5, expected.len() as i64)).unwrap();
        for index in [2i64, 0, 4, 1, 3] {
            r.expect_chunk(index).unwrap();
            let progress = r.receive(Bytes::from(parts[index as usize].clone())).unwrap();
            assert_eq!(progress.total, 5);
        }
        assert!(r.is_complete());
        assert_eq!(r.assemble().unwrap(), expected);
    }

    #[test]
    fn index_equal_to_total_is_rejected() {
        let mut r = ChunkReassembler::new();
        r.declare(declaration(3, 100)).unwrap();
        let err = r.expect_chunk(3).unwrap_err();
        assert!(matches!(err, PipelineError::ChunkProtocolViolation(_)));
        // Aborted: nothing else is accepted afterwards
        assert!(r.expect_chunk(0).is_err());
    }

    #[test]
    fn nonpositive_declaration_is_rejected() {
        let mut r = ChunkReassembler::new();
        assert!(r.declare(declaration(0, 100)).is_err());

        let mut r = ChunkReassembler::new();
        assert!(r.declare(declaration(3, 0)).is_err());
    }

    #[test]
    fn chunk_before_declaration_is_rejected() {
        let mut r = ChunkReassembler::new();
        assert!(r.expect_chunk(0).is_err());

        let mut r = ChunkReassembler::new();
        assert!(r.receive(Bytes::from(vec![1, 2, 3])).is_err());
    }

    #[test]
    fn duplicate_chunk_overwrites_without_double_count() {
        let mut r = ChunkReassembler::new();
        r.declare(declaration(2, 4)).unwrap();
        r.expect_chunk(0).unwrap();
        let p1 = r.receive(Bytes::from(vec![9, 9])).unwrap();
        r.expect_chunk(0).unwrap();
        let p2 = r.receive(Bytes::from(vec![1, 2])).unwrap();
        assert_eq!(p1.received, 1);
        assert_eq!(p2.received, 1);

        r.expect_chunk(1).unwrap();
        r.receive(Bytes::from(vec![3, 4])).unwrap();
        assert_eq!(r.assemble().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn inflated_declared_size_does_not_drive_allocation() {
        let mut r = ChunkReassembler::new();
        r.declare(declaration(1, 1 << 62)).unwrap();
        r.expect_chunk(0).unwrap();
        r.receive(Bytes::from(vec![7])).unwrap();
        assert_eq!(r.assemble().unwrap(), vec![7]);
    }

    #[test]
    fn assemble_with_missing_chunk_fails() {
        let mut r = ChunkReassembler::new();
        r.declare(declaration(3, 6)).unwrap();
        r.expect_chunk(0).unwrap();
        r.receive(Bytes::from(vec![1, 2])).unwrap();
        r.expect_chunk(2).unwrap();
        r.receive(Bytes::from(vec![5, 6])).unwrap();
        assert!(!r.is_complete());
        assert!(matches!(
            r.assemble().unwrap_err(),
            PipelineError::ChunkProtocolViolation(_)
        ));
    }
}
