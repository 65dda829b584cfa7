//! Handler trait for processing upload requests.
//!
//! Implementors provide the upload logic while the server framework
//! handles connection management, routing and the binary frame format.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use chunkyard_protocol::MessageType;
use chunkyard_protocol::binary::BinaryChunkHeader;
use chunkyard_protocol::envelope::Message;

use crate::connection::{Sender, not_implemented};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling messages from upload clients.
///
/// Each method receives a `sender` to reply on and the parsed request.
/// Replies must reuse the request id. Default implementations answer
/// with 501 so handlers only override what they support.
pub trait Handler: Send + Sync + 'static {
    /// Called for `ping`.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `query_resume`.
    fn on_query_resume(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg.id, not_implemented("resume not supported"));
        })
    }

    /// Called for `open_session`.
    fn on_open_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg.id, not_implemented("sessions not supported"));
        })
    }

    /// Called for `merge_upload`.
    fn on_merge_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg.id, not_implemented("merge not supported"));
        })
    }

    /// Called for every well-formed binary chunk frame.
    fn on_chunk(
        &self,
        sender: Sender,
        header: BinaryChunkHeader,
        _data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&header.id, not_implemented("chunks not supported"));
        })
    }

    /// Called after a client connection has closed.
    fn on_disconnected(&self, _peer_addr: SocketAddr) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}
