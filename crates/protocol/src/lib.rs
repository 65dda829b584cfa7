//! Wire protocol shared by the chunkyard server and client.
//!
//! Control operations travel as JSON [`Message`] envelopes; chunk writes
//! travel as binary frames (see [`binary`]).

pub mod binary;
pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use binary::{BinaryChunkHeader, ParseError, encode_chunk_frame, parse_chunk_frame};
pub use constants::MessageType;
pub use envelope::{ErrorKind, Message, WsError};
pub use messages::{
    ChunkAckResponse, MergeRequest, MergeResponse, OpenSessionRequest, OpenSessionResponse,
    QueryResumeRequest, ResumeStateResponse,
};
