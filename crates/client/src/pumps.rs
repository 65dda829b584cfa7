//! Background tasks behind [`WsTransport`](crate::ws::WsTransport).

use std::collections::HashMap;
use std::sync::Arc;

use chunkyard_protocol::constants::{WS_PING_PERIOD, WS_PONG_WAIT};
use chunkyard_protocol::envelope::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Removes a pending request when its waiter goes away, including when
/// the waiting future is dropped before a reply arrives.
pub(crate) struct PendingGuard {
    pending: PendingMap,
    id: String,
}

impl PendingGuard {
    pub(crate) fn new(pending: PendingMap, id: String) -> Self {
        Self { pending, id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.try_lock() {
            map.remove(&self.id);
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pending = Arc::clone(&self.pending);
            let id = std::mem::take(&mut self.id);
            handle.spawn(async move {
                pending.lock().await.remove(&id);
            });
        }
    }
}

/// Reads frames and routes replies to their waiting requests.
///
/// Any incoming frame pushes the liveness deadline forward. On exit every
/// pending request is dropped so its caller sees the connection close.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("server stopped answering, closing");
                break;
            }

            frame = read.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read error");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                };

                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match msg {
                    tungstenite::Message::Text(text) => route_reply(&text, &pending).await,
                    tungstenite::Message::Ping(data) => {
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    tungstenite::Message::Close(_) => {
                        debug!("received close frame");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    cancel.cancel();
    pending.lock().await.clear();
}

async fn route_reply(text: &str, pending: &PendingMap) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "failed to parse reply");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received reply");

    match pending.lock().await.remove(&msg.id) {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => {
            debug!(id = %msg.id, msg_type = ?msg.msg_type, "reply without a waiting request");
        }
    }
}

/// Drains the outgoing channel into the socket.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    warn!(error = %e, "WebSocket write error");
                    break;
                }
            }
        }
    }

    cancel.cancel();
    let _ = sink.close().await;
}

/// Sends a WebSocket ping every [`WS_PING_PERIOD`].
pub(crate) async fn ping_pump(write_tx: mpsc::Sender<tungstenite::Message>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if write_tx.send(tungstenite::Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
