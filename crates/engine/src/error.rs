//! Engine error types.

use chunkyard_transfer::StoreError;

/// Errors produced by the upload engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("checksum mismatch for chunk {chunk_index}")]
    ChecksumMismatch { chunk_index: u32 },

    #[error("session {session_id} expects {expected} chunks, request declared {got}")]
    SessionConflict {
        session_id: String,
        expected: u32,
        got: u32,
    },

    #[error("session {session_id} is missing {} chunk(s)", .missing.len())]
    IncompleteUpload { session_id: String, missing: Vec<u32> },

    #[error("session {session_id} was already merged")]
    AlreadyMerged {
        session_id: String,
        artifact_url: Option<String>,
    },

    #[error("session {0} is being merged")]
    MergeInProgress(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("storage error in session {session_id}{}: {source}", chunk_suffix(.chunk_index))]
    Storage {
        session_id: String,
        chunk_index: Option<u32>,
        #[source]
        source: StoreError,
    },
}

fn chunk_suffix(chunk_index: &Option<u32>) -> String {
    chunk_index
        .map(|i| format!(" (chunk {i})"))
        .unwrap_or_default()
}

impl EngineError {
    /// Wraps a store failure, keeping the session and chunk context.
    ///
    /// Invalid ids or names reported by the store are client input errors.
    pub(crate) fn storage(session_id: &str, chunk_index: Option<u32>, source: StoreError) -> Self {
        match source {
            StoreError::InvalidSessionId(msg) | StoreError::InvalidArtifactName(msg) => {
                Self::InvalidRequest(msg)
            }
            source => Self::Storage {
                session_id: session_id.to_string(),
                chunk_index,
                source,
            },
        }
    }

    /// HTTP-style status code for the error category.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) | Self::ChecksumMismatch { .. } => 400,
            Self::SessionNotFound(_) => 404,
            Self::SessionConflict { .. }
            | Self::IncompleteUpload { .. }
            | Self::AlreadyMerged { .. }
            | Self::MergeInProgress(_) => 409,
            Self::Storage { .. } => 500,
        }
    }

    /// Returns `true` if repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code() >= 500
    }
}
