//! Transport seam between the uploader and the wire.

use std::future::Future;
use std::pin::Pin;

use chunkyard_protocol::{
    ChunkAckResponse, MergeRequest, MergeResponse, OpenSessionRequest, OpenSessionResponse,
};

use crate::error::ClientError;

/// A boxed future returned by transport methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// One chunk ready to send.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub session_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub file_name: String,
    pub file_type: String,
    /// SHA-256 hex of `data`, or empty.
    pub checksum: String,
    pub data: Vec<u8>,
}

/// Request/response operations an upload needs from a server.
///
/// Server-side rejections surface as [`ClientError::Server`].
pub trait UploadTransport: Send + Sync {
    /// Indices already stored for `session_id`.
    fn query_resume(&self, session_id: String) -> TransportFuture<'_, Vec<u32>>;

    fn open_session(&self, req: OpenSessionRequest) -> TransportFuture<'_, OpenSessionResponse>;

    fn write_chunk(&self, chunk: ChunkUpload) -> TransportFuture<'_, ChunkAckResponse>;

    fn merge(&self, req: MergeRequest) -> TransportFuture<'_, MergeResponse>;
}
