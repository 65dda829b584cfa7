//! [`Handler`] implementation backed by an [`UploadEngine`].

use std::net::SocketAddr;
use std::sync::Arc;

use chunkyard_engine::{ChunkWrite, EngineError, UploadEngine};
use chunkyard_protocol::binary::BinaryChunkHeader;
use chunkyard_protocol::constants::{WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_INTERNAL};
use chunkyard_protocol::envelope::{ErrorKind, Message, WsError};
use chunkyard_protocol::{
    ChunkAckResponse, MergeRequest, MergeResponse, MessageType, OpenSessionRequest,
    OpenSessionResponse, QueryResumeRequest, ResumeStateResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::connection::Sender;
use crate::handler::{Handler, HandlerFuture};

/// Converts an engine error into its wire form.
pub fn to_ws_error(err: &EngineError) -> WsError {
    let kind = match err {
        EngineError::InvalidRequest(_) | EngineError::ChecksumMismatch { .. } => {
            ErrorKind::InvalidRequest
        }
        EngineError::SessionConflict { .. } => ErrorKind::SessionConflict,
        EngineError::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
        EngineError::AlreadyMerged { .. } => ErrorKind::AlreadyMerged,
        EngineError::MergeInProgress(_) => ErrorKind::MergeInProgress,
        EngineError::SessionNotFound(_) => ErrorKind::SessionNotFound,
        EngineError::Storage { .. } => ErrorKind::Storage,
    };

    let mut wire = WsError::new(err.code(), kind, err.to_string());
    match err {
        EngineError::IncompleteUpload { missing, .. } => wire.missing_chunks = missing.clone(),
        EngineError::AlreadyMerged { artifact_url, .. } => wire.artifact_url = artifact_url.clone(),
        EngineError::ChecksumMismatch { chunk_index } => wire.chunk_index = Some(*chunk_index),
        EngineError::Storage { chunk_index, .. } => wire.chunk_index = *chunk_index,
        _ => {}
    }
    wire
}

/// Serves upload requests from an [`UploadEngine`].
///
/// Every engine call runs on the blocking pool.
pub struct UploadHandler {
    engine: Arc<UploadEngine>,
}

impl UploadHandler {
    pub fn new(engine: Arc<UploadEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<UploadEngine> {
        &self.engine
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, WsError>
    where
        F: FnOnce(&UploadEngine) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        match tokio::task::spawn_blocking(move || f(&engine)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_retryable() {
                    error!(error = %e, "engine operation failed");
                } else {
                    debug!(error = %e, "request rejected");
                }
                Err(to_ws_error(&e))
            }
            Err(e) => {
                error!(error = %e, "engine task panicked");
                Err(WsError::new(
                    WS_ERR_CODE_INTERNAL,
                    ErrorKind::Internal,
                    "internal error",
                ))
            }
        }
    }
}

fn request<T: DeserializeOwned>(msg: &Message) -> Result<T, WsError> {
    match msg.parse_payload::<T>() {
        Ok(Some(payload)) => Ok(payload),
        Ok(None) => Err(bad_request("missing payload".into())),
        Err(e) => Err(bad_request(format!("invalid payload: {e}"))),
    }
}

fn bad_request(message: String) -> WsError {
    WsError::new(WS_ERR_CODE_BAD_REQUEST, ErrorKind::InvalidRequest, message)
}

/// Sends either the success reply or the error for request `id`.
fn respond<T: Serialize>(sender: &Sender, id: &str, msg_type: MessageType, result: Result<T, WsError>) {
    let msg = match result {
        Ok(payload) => match Message::new(id, msg_type, Some(&payload)) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "failed to encode reply");
                return;
            }
        },
        Err(err) => Message::error(id, err),
    };
    if sender.send_msg(msg).is_err() {
        warn!(id, "client went away before the reply was sent");
    }
}

impl Handler for UploadHandler {
    fn on_query_resume(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = async {
                let req: QueryResumeRequest = request(&msg)?;
                let session_id = req.session_id.clone();
                let uploaded_chunks = self
                    .blocking(move |engine| engine.query_resume(&req.session_id))
                    .await?;
                Ok::<_, WsError>(ResumeStateResponse {
                    session_id,
                    uploaded_chunks,
                })
            }
            .await;
            respond(&sender, &msg.id, MessageType::ResumeState, result);
        })
    }

    fn on_open_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = async {
                let req: OpenSessionRequest = request(&msg)?;
                let session_id = req.session_id.clone();
                let opened = self
                    .blocking(move |engine| {
                        engine.open_session(
                            &req.session_id,
                            req.total_chunks,
                            &req.file_name,
                            &req.file_type,
                        )
                    })
                    .await?;
                Ok::<_, WsError>(OpenSessionResponse {
                    session_id,
                    created: opened.created,
                    uploaded_chunks: opened.uploaded,
                })
            }
            .await;
            respond(&sender, &msg.id, MessageType::SessionOpened, result);
        })
    }

    fn on_merge_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = async {
                let req: MergeRequest = request(&msg)?;
                let outcome = self
                    .blocking(move |engine| {
                        engine.merge(&req.session_id, &req.file_name, &req.file_type)
                    })
                    .await?;
                Ok::<_, WsError>(MergeResponse {
                    session_id: outcome.session_id,
                    artifact_url: outcome.artifact_url,
                    size: outcome.size,
                })
            }
            .await;
            respond(&sender, &msg.id, MessageType::MergeResult, result);
        })
    }

    fn on_chunk(
        &self,
        sender: Sender,
        header: BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let id = header.id.clone();
            let session_id = header.session_id.clone();
            let chunk_index = header.chunk_index;

            let result = self
                .blocking(move |engine| {
                    engine.write_chunk(ChunkWrite {
                        session_id: &header.session_id,
                        chunk_index: header.chunk_index,
                        total_chunks: header.total_chunks,
                        file_name: &header.file_name,
                        file_type: &header.file_type,
                        checksum: &header.checksum,
                        data: &data,
                    })
                })
                .await
                .map(|uploaded_chunks| ChunkAckResponse {
                    session_id,
                    chunk_index,
                    uploaded_chunks,
                });
            respond(&sender, &id, MessageType::ChunkAck, result);
        })
    }

    fn on_disconnected(&self, peer_addr: SocketAddr) -> HandlerFuture<'_> {
        Box::pin(async move {
            debug!(%peer_addr, "upload client disconnected");
        })
    }
}
