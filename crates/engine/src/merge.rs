//! Merge orchestration: chunk concatenation into a single artifact.

use std::io::Write;
use std::sync::Arc;

use chunkyard_transfer::{ArtifactSink, ChunkStore, StoreError, artifact_name};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::registry::{SessionRegistry, already_merged, check_session_id};

/// A successfully merged upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub session_id: String,
    pub artifact_name: String,
    pub artifact_url: String,
    /// Artifact size in bytes.
    pub size: u64,
}

/// Concatenates a complete session's chunks into the artifact sink.
///
/// At most one merge per session runs at a time. A caller that waited
/// behind a successful merge gets [`EngineError::AlreadyMerged`] with the
/// artifact URL instead of a second artifact.
pub struct MergeOrchestrator {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ChunkStore>,
    sink: Arc<dyn ArtifactSink>,
}

impl MergeOrchestrator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ChunkStore>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            registry,
            store,
            sink,
        }
    }

    /// Merges a session.
    ///
    /// Empty `file_name`/`file_type` fall back to the values declared when
    /// the session was opened.
    pub fn merge(
        &self,
        session_id: &str,
        file_name: &str,
        file_type: &str,
    ) -> Result<MergeOutcome, EngineError> {
        check_session_id(session_id)?;

        let Some(entry) = self.registry.entry(session_id) else {
            return Err(match self.registry.tombstone(session_id) {
                Some(t) => already_merged(session_id, &t),
                None => EngineError::SessionNotFound(session_id.to_string()),
            });
        };

        let _serial = entry.merge_lock.lock().unwrap();

        // Someone may have finished this merge while we waited.
        if let Some(t) = self.registry.tombstone(session_id) {
            return Err(already_merged(session_id, &t));
        }

        let (total_chunks, file_name, file_type) = {
            let mut st = entry.state.lock().unwrap();
            let missing = st.missing();
            if !missing.is_empty() {
                return Err(EngineError::IncompleteUpload {
                    session_id: session_id.to_string(),
                    missing,
                });
            }
            st.merging = true;
            (
                st.total_chunks,
                or_declared(file_name, &st.file_name),
                or_declared(file_type, &st.file_type),
            )
        };

        // Swept between lookup and flagging.
        if !self.registry.is_current(session_id, &entry) {
            entry.state.lock().unwrap().merging = false;
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }

        match self.concatenate(session_id, total_chunks, &file_name, &file_type) {
            Ok(outcome) => {
                self.registry.complete_merge(session_id, &outcome.artifact_url);
                if let Err(e) = self.store.discard(session_id) {
                    warn!(session = %session_id, error = %e, "failed to discard merged chunks");
                }
                info!(
                    session = %session_id,
                    artifact = %outcome.artifact_name,
                    size = outcome.size,
                    "upload merged"
                );
                Ok(outcome)
            }
            Err(EngineError::Storage {
                source: StoreError::MissingChunk(index),
                ..
            }) => {
                // The store lost a chunk we counted as received.
                warn!(session = %session_id, chunk = index, "chunk vanished before merge");
                entry.state.lock().unwrap().merging = false;
                let missing = self.registry.resync(session_id, &entry)?;
                Err(EngineError::IncompleteUpload {
                    session_id: session_id.to_string(),
                    missing,
                })
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "merge failed, session kept for retry");
                entry.state.lock().unwrap().merging = false;
                Err(e)
            }
        }
    }

    fn concatenate(
        &self,
        session_id: &str,
        total_chunks: u32,
        file_name: &str,
        file_type: &str,
    ) -> Result<MergeOutcome, EngineError> {
        let name = artifact_name(file_name, file_type);
        let mut writer = self
            .sink
            .begin(&name)
            .map_err(|e| EngineError::storage(session_id, None, e))?;

        let size = self
            .store
            .read_in_order(session_id, total_chunks, &mut writer)
            .map_err(|e| match e {
                StoreError::MissingChunk(index) => EngineError::storage(session_id, Some(index), e),
                e => EngineError::storage(session_id, None, e),
            })?;
        writer
            .flush()
            .map_err(|e| EngineError::storage(session_id, None, e.into()))?;

        let artifact_url = writer
            .commit()
            .map_err(|e| EngineError::storage(session_id, None, e))?;

        Ok(MergeOutcome {
            session_id: session_id.to_string(),
            artifact_name: name,
            artifact_url,
            size,
        })
    }
}

fn or_declared(requested: &str, declared: &str) -> String {
    if requested.is_empty() {
        declared.to_string()
    } else {
        requested.to_string()
    }
}
