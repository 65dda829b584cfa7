//! WebSocket transport to a chunkyard server.
//!
//! Requests are correlated with replies by a UUID carried in the message
//! id (or the binary frame header). Replies may arrive in any order.

use std::sync::Arc;
use std::time::Duration;

use chunkyard_protocol::binary::{BinaryChunkHeader, encode_chunk_frame};
use chunkyard_protocol::constants::{
    MessageType, WS_BINARY_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_MERGE_TIMEOUT,
    WS_REQUEST_TIMEOUT,
};
use chunkyard_protocol::envelope::Message;
use chunkyard_protocol::{
    ChunkAckResponse, MergeRequest, MergeResponse, OpenSessionRequest, OpenSessionResponse,
    QueryResumeRequest, ResumeStateResponse,
};
use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ClientError;
use crate::pumps::{self, PendingGuard, PendingMap};
use crate::transport::{ChunkUpload, TransportFuture, UploadTransport};

const WRITE_BUFFER_SIZE: usize = 256;

/// A WebSocket connection to one upload server.
///
/// Safe to share between tasks; every request waits only for its own reply.
pub struct WsTransport {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WsTransport {
    /// Connects to `url` (e.g. `ws://host:port`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel(WRITE_BUFFER_SIZE);
        let pending: PendingMap = Arc::new(Mutex::new(Default::default()));
        let cancel = CancellationToken::new();

        let handles = vec![
            tokio::spawn(pumps::write_pump(write, write_rx, cancel.clone())),
            tokio::spawn(pumps::read_pump(
                read,
                Arc::clone(&pending),
                write_tx.clone(),
                cancel.clone(),
            )),
            tokio::spawn(pumps::ping_pump(write_tx.clone(), cancel.clone())),
        ];

        info!(url, "connected to upload server");

        Ok(Self {
            write_tx,
            pending,
            cancel,
            handles,
        })
    }

    /// Round-trips an application-level ping.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, MessageType::Ping, Option::<&()>::None)?;
        let frame = tungstenite::Message::Text(serde_json::to_string(&msg)?.into());
        self.await_reply(id, frame, WS_REQUEST_TIMEOUT).await?;
        Ok(())
    }

    /// Returns `false` once the connection has gone away.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Closes the connection. Outstanding requests fail with
    /// [`ClientError::Closed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, Some(payload))?;
        let frame = tungstenite::Message::Text(serde_json::to_string(&msg)?.into());
        self.await_reply(id, frame, timeout).await
    }

    async fn send_chunk(&self, chunk: ChunkUpload) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let header = BinaryChunkHeader {
            id: id.clone(),
            session_id: chunk.session_id,
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            file_name: chunk.file_name,
            file_type: chunk.file_type,
            checksum: chunk.checksum,
        };
        let frame = encode_chunk_frame(&header, &chunk.data)?;
        self.await_reply(id, tungstenite::Message::Binary(frame.into()), WS_BINARY_REQUEST_TIMEOUT)
            .await
    }

    async fn await_reply(
        &self,
        id: String,
        frame: tungstenite::Message,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        let _guard = PendingGuard::new(Arc::clone(&self.pending), id.clone());

        if self.write_tx.send(frame).await.is_err() {
            return Err(ClientError::Closed);
        }

        let result = tokio::select! {
            r = tokio::time::timeout(timeout, rx) => Some(r),
            _ = self.cancel.cancelled() => None,
        };

        match result {
            Some(Ok(Ok(resp))) => into_result(resp),
            Some(Ok(Err(_))) | None => Err(ClientError::Closed),
            Some(Err(_)) => {
                debug!(id, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn into_result(resp: Message) -> Result<Message, ClientError> {
    match resp.error {
        Some(err) => Err(ClientError::Server(err)),
        None => Ok(resp),
    }
}

fn decode<R: DeserializeOwned>(resp: Message, what: &'static str) -> Result<R, ClientError> {
    resp.parse_payload::<R>()?
        .ok_or(ClientError::EmptyResponse(what))
}

impl UploadTransport for WsTransport {
    fn query_resume(&self, session_id: String) -> TransportFuture<'_, Vec<u32>> {
        Box::pin(async move {
            let req = QueryResumeRequest { session_id };
            let resp = self
                .request(MessageType::QueryResume, &req, WS_REQUEST_TIMEOUT)
                .await?;
            let state: ResumeStateResponse = decode(resp, "resume_state")?;
            Ok(state.uploaded_chunks)
        })
    }

    fn open_session(&self, req: OpenSessionRequest) -> TransportFuture<'_, OpenSessionResponse> {
        Box::pin(async move {
            let resp = self
                .request(MessageType::OpenSession, &req, WS_REQUEST_TIMEOUT)
                .await?;
            decode(resp, "session_opened")
        })
    }

    fn write_chunk(&self, chunk: ChunkUpload) -> TransportFuture<'_, ChunkAckResponse> {
        Box::pin(async move {
            let resp = self.send_chunk(chunk).await?;
            decode(resp, "chunk_ack")
        })
    }

    fn merge(&self, req: MergeRequest) -> TransportFuture<'_, MergeResponse> {
        Box::pin(async move {
            let resp = self
                .request(MessageType::MergeUpload, &req, WS_MERGE_TIMEOUT)
                .await?;
            decode(resp, "merge_result")
        })
    }
}
