//! Chunk persistence, artifact sinks, and chunked reading of source files.
//!
//! The [`ChunkStore`] trait is the durable home of individual chunk
//! payloads keyed by `(session_id, chunk_index)`. The [`ArtifactSink`]
//! trait receives the merged file. Both are synchronous: callers on an
//! async runtime are expected to offload them to a blocking pool.

mod artifact;
mod chunked;
mod fs_store;
mod store;
mod validation;

pub use artifact::{
    ArtifactSink, ArtifactWriter, FsArtifactSink, MemoryArtifactSink, artifact_name,
};
pub use chunked::{Chunk, ChunkReader, calculate_file_checksum, checksum_bytes, verify_checksum};
pub use fs_store::FsChunkStore;
pub use store::{ChunkStore, MemoryChunkStore, NamespaceInfo};
pub use validation::{sanitize_file_name, validate_artifact_name, validate_session_id};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk {0} is missing")]
    MissingChunk(u32),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("invalid artifact name: {0}")]
    InvalidArtifactName(String),
}
