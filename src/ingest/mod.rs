//! Upload ingestion: reassembly of chunked binary uploads.

mod chunk;

pub use chunk::{ChunkProgress, ChunkReassembler, UploadDeclaration};
