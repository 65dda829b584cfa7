//! Resumable chunked upload client.
//!
//! [`UploadClient`] drives one upload end to end over any
//! [`UploadTransport`]; [`WsTransport`] is the WebSocket implementation.

pub mod error;
mod pumps;
pub mod retry;
pub mod transport;
pub mod uploader;
pub mod ws;

pub use error::ClientError;
pub use retry::{RetryError, RetryPolicy, Sleeper, TokioSleeper, retry};
pub use transport::{ChunkUpload, TransportFuture, UploadTransport};
pub use uploader::{UploadClient, UploadEvent, UploadOptions, UploadOutcome};
pub use ws::WsTransport;
