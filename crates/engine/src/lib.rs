//! Server-side upload engine.
//!
//! Tracks upload sessions, answers resume queries, ingests chunks into a
//! [`ChunkStore`](chunkyard_transfer::ChunkStore) and merges complete
//! sessions into an [`ArtifactSink`](chunkyard_transfer::ArtifactSink).
//! Everything here is synchronous; [`spawn_sweeper`] is the only async
//! entry point.

mod clock;
mod engine;
mod error;
mod merge;
mod registry;
mod resume;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{ChunkWrite, EngineConfig, UploadEngine};
pub use error::EngineError;
pub use merge::{MergeOrchestrator, MergeOutcome};
pub use registry::{OpenedSession, SHARD_COUNT, SessionRegistry, SessionSnapshot, Tombstone};
pub use resume::ResumeQueryService;
pub use sweeper::spawn_sweeper;
