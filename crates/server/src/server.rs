//! Upload WebSocket server.
//!
//! Listens on a TCP port, upgrades incoming connections to WebSocket and
//! serves any number of clients concurrently.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chunkyard_protocol::constants::WS_MAX_MESSAGE_SIZE;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ServerError;
use crate::connection::{self, ClientConnection};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}

/// The upload WebSocket server.
pub struct UploadServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    connections: Mutex<HashMap<String, ClientConnection>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> UploadServer<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            connections: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of open client connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address and serves until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!(%local_addr, "upload server listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    for (_, conn) in self.connections.lock().await.drain() {
                        conn.close();
                    }
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    warn!(%peer_addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades a TCP connection and tracks it until it closes.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Err(ServerError::ShuttingDown);
        }

        let ws_stream = accept_async_with_config(stream, Some(ws_config())).await?;

        let conn = connection::spawn_connection(
            ws_stream,
            peer_addr,
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );
        let conn_id = conn.id.clone();
        let done = conn.cancel_token();
        info!(conn = %conn_id, %peer_addr, "client connected");

        self.connections.lock().await.insert(conn_id.clone(), conn);

        // Forget the connection once its pumps stop.
        done.cancelled().await;
        self.connections.lock().await.remove(&conn_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UploadHandler;
    use crate::handler::HandlerFuture;
    use crate::connection::Sender;
    use chunkyard_engine::{EngineConfig, UploadEngine};
    use chunkyard_protocol::binary::{BinaryChunkHeader, encode_chunk_frame};
    use chunkyard_protocol::envelope::{ErrorKind, Message};
    use chunkyard_protocol::{MessageType, ResumeStateResponse};
    use chunkyard_transfer::{MemoryArtifactSink, MemoryChunkStore};
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Handler that only counts disconnects; everything else is default.
    struct CountingHandler {
        disconnects: AtomicUsize,
    }

    impl Handler for CountingHandler {
        fn on_disconnected(&self, _peer_addr: SocketAddr) -> HandlerFuture<'_> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_query_resume(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                let reply = msg
                    .reply(
                        MessageType::ResumeState,
                        Some(&ResumeStateResponse {
                            session_id: "fixed".into(),
                            uploaded_chunks: vec![1],
                        }),
                    )
                    .unwrap();
                let _ = sender.send_msg(reply);
            })
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        }
    }

    async fn start<H: Handler>(handler: H) -> (Arc<UploadServer<H>>, tokio::task::JoinHandle<()>, String) {
        let server = UploadServer::new(local_config(), handler);
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        for _ in 0..100 {
            if server.port().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let url = format!("ws://127.0.0.1:{}", server.port().await);
        (server, handle, url)
    }

    async fn next_message<S>(ws: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("reply in time")
                .expect("stream open")
                .expect("valid frame");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn memory_handler() -> UploadHandler {
        UploadHandler::new(Arc::new(UploadEngine::new(
            Arc::new(MemoryChunkStore::new()),
            Arc::new(MemoryArtifactSink::new()),
            EngineConfig::default(),
        )))
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, _) = start(CountingHandler {
            disconnects: AtomicUsize::new(0),
        })
        .await;

        assert!(server.port().await > 0);
        assert_eq!(server.connection_count().await, 0);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn server_accepts_several_clients() {
        let (server, handle, url) = start(CountingHandler {
            disconnects: AtomicUsize::new(0),
        })
        .await;

        let (ws1, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (ws2, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.connection_count().await, 2);

        drop(ws1);
        drop(ws2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.handler().disconnects.load(Ordering::SeqCst), 2);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ping_gets_pong_and_unknown_gets_501() {
        let (server, handle, url) = start(CountingHandler {
            disconnects: AtomicUsize::new(0),
        })
        .await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let ping = serde_json::json!({"id": "p1", "type": "ping"});
        ws.send(WsMessage::Text(ping.to_string().into())).await.unwrap();
        let pong = next_message(&mut ws).await;
        assert_eq!(pong.id, "p1");
        assert_eq!(pong.msg_type, MessageType::Pong);

        let odd = serde_json::json!({"id": "u1", "type": "teleport"});
        ws.send(WsMessage::Text(odd.to_string().into())).await.unwrap();
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "u1");
        assert_eq!(reply.error.unwrap().code, 501);

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dispatches_to_custom_handler() {
        let (server, handle, url) = start(CountingHandler {
            disconnects: AtomicUsize::new(0),
        })
        .await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let query = serde_json::json!({"id": "q1", "type": "query_resume", "payload": {"sessionId": "x"}});
        ws.send(WsMessage::Text(query.to_string().into())).await.unwrap();
        let reply = next_message(&mut ws).await;
        let state: ResumeStateResponse = reply.parse_payload().unwrap().unwrap();
        assert_eq!(state.uploaded_chunks, vec![1]);

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn upload_handler_acks_chunks_and_reports_resume() {
        let (server, handle, url) = start(memory_handler()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let header = BinaryChunkHeader {
            id: "c1".into(),
            session_id: "sess-1".into(),
            chunk_index: 1,
            total_chunks: 3,
            file_name: "a.bin".into(),
            file_type: String::new(),
            checksum: String::new(),
        };
        let frame = encode_chunk_frame(&header, b"middle").unwrap();
        ws.send(WsMessage::Binary(frame.into())).await.unwrap();

        let ack = next_message(&mut ws).await;
        assert_eq!(ack.id, "c1");
        assert_eq!(ack.msg_type, MessageType::ChunkAck);

        let query = serde_json::json!({"id": "q1", "type": "query_resume", "payload": {"sessionId": "sess-1"}});
        ws.send(WsMessage::Text(query.to_string().into())).await.unwrap();
        let reply = next_message(&mut ws).await;
        let state: ResumeStateResponse = reply.parse_payload().unwrap().unwrap();
        assert_eq!(state.uploaded_chunks, vec![1]);

        let merge = serde_json::json!({"id": "m1", "type": "merge_upload", "payload": {"sessionId": "sess-1", "fileName": "a.bin"}});
        ws.send(WsMessage::Text(merge.to_string().into())).await.unwrap();
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "m1");
        let err = reply.error.expect("merge should fail");
        assert_eq!(err.code, 409);
        assert_eq!(err.kind, ErrorKind::IncompleteUpload);
        assert_eq!(err.missing_chunks, vec![0, 2]);

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_chunk_frame_is_rejected_with_id() {
        let (server, handle, url) = start(memory_handler()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        // Header lacks chunkIndex.
        let header = serde_json::to_vec(&serde_json::json!({
            "id": "bad-1",
            "sessionId": "s",
            "totalChunks": 2,
            "fileName": "a"
        }))
        .unwrap();
        let mut frame = (header.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&header);
        frame.extend_from_slice(b"data");
        ws.send(WsMessage::Binary(frame.into())).await.unwrap();

        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "bad-1");
        let err = reply.error.unwrap();
        assert_eq!(err.code, 400);
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn missing_payload_is_bad_request() {
        let (server, handle, url) = start(memory_handler()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let open = serde_json::json!({"id": "o1", "type": "open_session"});
        ws.send(WsMessage::Text(open.to_string().into())).await.unwrap();
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.error.unwrap().code, 400);

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }
}
