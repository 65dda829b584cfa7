use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead. Generous enough to cover a slow merge
/// of a large artifact on the server side.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (64 MiB).
///
/// Must exceed the largest chunk the server accepts plus its header.
pub const WS_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Timeout for request/response operations (text messages).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for binary chunk writes.
///
/// Chunk writes include an fsync on the server and may take noticeably
/// longer than control messages.
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for merge requests, which stream every chunk into the artifact.
pub const WS_MERGE_TIMEOUT: Duration = Duration::from_secs(600);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from client to server
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "query_resume")]
    QueryResume,
    #[serde(rename = "open_session")]
    OpenSession,
    #[serde(rename = "merge_upload")]
    MergeUpload,

    // Responses from server to client
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "resume_state")]
    ResumeState,
    #[serde(rename = "session_opened")]
    SessionOpened,
    #[serde(rename = "chunk_ack")]
    ChunkAck,
    #[serde(rename = "merge_result")]
    MergeResult,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Malformed or missing request fields, checksum mismatch.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
/// Unknown upload session.
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
/// Session conflict, incomplete upload, already merged, merge in progress.
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
/// Storage failure; the request may be retried.
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
/// Message type the server does not handle.
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
