//! WebSocket server for chunkyard uploads.
//!
//! Accepts any number of client connections, dispatches JSON control
//! messages and binary chunk frames to a [`Handler`], and manages each
//! connection's lifecycle (ping/pong, graceful shutdown).
//! [`UploadHandler`] is the handler that drives an
//! [`UploadEngine`](chunkyard_engine::UploadEngine).

mod connection;
mod handler;
mod server;
mod upload;

pub use connection::{ClientConnection, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, UploadServer};
pub use upload::{UploadHandler, to_ws_error};

/// Send buffer capacity per connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Requests a single connection may have in flight at once.
pub const MAX_INFLIGHT_PER_CONNECTION: usize = 16;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server is shutting down")]
    ShuttingDown,
}
