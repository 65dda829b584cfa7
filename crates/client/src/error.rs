//! Client error types.

use chunkyard_protocol::envelope::{ErrorKind, WsError};
use chunkyard_transfer::StoreError;

/// Errors produced by the upload client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("source error: {0}")]
    Source(#[from] StoreError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("server error {}: {}", .0.code, .0.message)]
    Server(WsError),

    #[error("empty {0} response")]
    EmptyResponse(&'static str),

    #[error("chunk {chunk_index} failed after {attempts} attempt(s): {source}")]
    ChunkFailed {
        chunk_index: u32,
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error("session {session_id} still missing {} chunk(s) after {rounds} merge round(s)", .missing.len())]
    MergeFailed {
        session_id: String,
        rounds: u32,
        missing: Vec<u32>,
    },

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Returns `true` for transient failures worth another attempt:
    /// timeouts and server-side (5xx) errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Server(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Protocol error kind, if the server rejected the request.
    pub fn server_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Server(e) => Some(e.kind),
            Self::ChunkFailed { source, .. } => source.server_kind(),
            _ => None,
        }
    }
}
