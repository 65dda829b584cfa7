//! Client connection management: read/write pumps, ping/pong, send buffering.

use std::net::SocketAddr;
use std::sync::Arc;

use chunkyard_protocol::binary::{parse_chunk_frame, peek_frame_id};
use chunkyard_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED, WS_PING_PERIOD,
    WS_PONG_WAIT,
};
use chunkyard_protocol::envelope::{ErrorKind, Message, WsError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Semaphore, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::Handler;
use crate::{MAX_INFLIGHT_PER_CONNECTION, SEND_BUFFER_SIZE};

/// Handle for sending messages to one connected client.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` only if the buffer is full or the client is gone.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error reply correlated to `id`.
    pub fn send_error(&self, id: &str, error: WsError) -> Result<(), SendError> {
        self.send_msg(Message::error(id, error))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a client.
///
/// Owns the pump tasks through its cancellation token.
pub struct ClientConnection {
    pub id: String,
    pub peer_addr: SocketAddr,
    sender: Sender,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals the pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Starts the read and write pumps for an upgraded WebSocket.
///
/// The pumps run as background tasks and stop when the client goes away
/// or `server_cancel` fires.
pub(crate) fn spawn_connection<S, H>(
    ws_stream: S,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ClientConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };
    let id = uuid::Uuid::new_v4().to_string();

    let conn = ClientConnection {
        id: id.clone(),
        peer_addr,
        sender: sender.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    tokio::spawn(async move {
        read_pump(ws_stream, sender, Arc::clone(&handler), cancel.clone()).await;
        // Stop the write pump with us.
        cancel.cancel();
        handler.on_disconnected(peer_addr).await;
        info!(conn = %id, %peer_addr, "client disconnected");
    });

    conn
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(ws_msg) = msg else { break };
                if let Err(e) = sink.send(ws_msg).await {
                    error!(error = %e, "write pump send error");
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    error!(error = %e, "write pump ping error");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches them to the handler.
///
/// Each request runs as its own task so chunk writes on one connection
/// proceed in parallel, bounded by [`MAX_INFLIGHT_PER_CONNECTION`].
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_PER_CONNECTION));
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    warn!("pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                let ws_msg = match frame {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        error!(error = %e, "read pump error");
                        break;
                    }
                    None => break,
                };

                // Any traffic proves the peer is alive.
                got_pong = true;

                match ws_msg {
                    WsMessage::Text(text) => {
                        let Ok(permit) = Arc::clone(&inflight).acquire_owned().await else { break };
                        let handler = Arc::clone(&handler);
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            dispatch_text(&handler, &sender, &text).await;
                            drop(permit);
                        });
                    }
                    WsMessage::Binary(data) => {
                        let Ok(permit) = Arc::clone(&inflight).acquire_owned().await else { break };
                        let handler = Arc::clone(&handler);
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            dispatch_binary(&handler, &sender, &data).await;
                            drop(permit);
                        });
                    }
                    WsMessage::Pong(_) => {
                        pong_deadline.reset();
                    }
                    WsMessage::Ping(data) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                    }
                    WsMessage::Close(_) => {
                        debug!("received close frame");
                        break;
                    }
                    WsMessage::Frame(_) => {}
                }
            }
        }
    }
}

/// Routes a JSON control message to the matching handler method.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "invalid message JSON");
            let _ = sender.send_error(
                "",
                WsError::new(
                    WS_ERR_CODE_BAD_REQUEST,
                    ErrorKind::InvalidRequest,
                    format!("invalid message: {e}"),
                ),
            );
            return;
        }
    };

    let s = sender.clone();
    match msg.msg_type {
        MessageType::Ping => handler.on_ping(s, msg).await,
        MessageType::QueryResume => handler.on_query_resume(s, msg).await,
        MessageType::OpenSession => handler.on_open_session(s, msg).await,
        MessageType::MergeUpload => handler.on_merge_upload(s, msg).await,
        _ => {
            warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg.id, not_implemented("unknown message type"));
        }
    }
}

/// Parses a binary chunk frame and hands it to the handler.
///
/// Malformed frames are answered with a 400 error carrying whatever
/// request id could be recovered from the header.
async fn dispatch_binary<H: Handler>(handler: &Arc<H>, sender: &Sender, data: &[u8]) {
    match parse_chunk_frame(data) {
        Ok((header, payload)) => {
            handler.on_chunk(sender.clone(), header, payload).await;
        }
        Err(e) => {
            warn!(error = %e, "failed to parse chunk frame");
            let id = peek_frame_id(data).unwrap_or_default();
            let _ = sender.send_error(
                &id,
                WsError::new(
                    WS_ERR_CODE_BAD_REQUEST,
                    ErrorKind::InvalidRequest,
                    format!("invalid chunk frame: {e}"),
                ),
            );
        }
    }
}

pub(crate) fn not_implemented(message: &str) -> WsError {
    WsError::new(WS_ERR_CODE_NOT_IMPLEMENTED, ErrorKind::Internal, message)
}
