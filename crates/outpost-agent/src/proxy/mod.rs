//! Proxy channel drivers
//!
//! Each open channel is driven by one task that owns the local resource
//! (a TCP socket, an HTTP response or a WebSocket connection). Inbound data
//! and close frames reach the driver through the session's channel registry.

pub mod http;
pub mod tcp;
pub mod websocket;

use outpost_proto::{ChannelId, Frame, ProxyHttpResponse, READ_CHUNK_SIZE};
use outpost_transport::{Channel, FrameSender};
use tracing::trace;

use crate::session::SessionContext;

/// Route a 0x21 frame to its channel
pub async fn deliver(ctx: &SessionContext, frame: &Frame) {
    match frame.parse_channel_data() {
        Ok(data) => ctx.channels.deliver(data.id, data.data).await,
        Err(e) => ctx.sender.diagnostic(format!("bad frame: {}", e)).await,
    }
}

/// Handle a 0x22 frame from the peer
pub async fn close(ctx: &SessionContext, frame: &Frame) {
    match frame.channel_id() {
        Ok(id) => ctx.channels.close(id).await,
        Err(e) => ctx.sender.diagnostic(format!("bad frame: {}", e)).await,
    }
}

/// Send `data` as 0x21 frames of at most one read chunk each
pub(crate) async fn send_chunked(sender: &FrameSender, id: ChannelId, data: &[u8]) -> bool {
    for chunk in data.chunks(READ_CHUNK_SIZE) {
        if sender.send(Frame::channel_data(id, chunk)).await.is_err() {
            return false;
        }
    }
    true
}

/// Send an HTTP or WebSocket dial result
pub(crate) async fn reply(
    sender: &FrameSender,
    id: ChannelId,
    response: &ProxyHttpResponse,
) -> bool {
    match Frame::http_dial_result(id, response) {
        Ok(frame) => sender.send(frame).await.is_ok(),
        Err(e) => {
            sender.diagnostic(format!("bad dial result: {}", e)).await;
            false
        }
    }
}

/// Tell the peer the channel is done and release it
pub(crate) async fn finish(channel: Channel) {
    let id = channel.id();
    let sender = channel.sender().clone();
    drop(channel);
    trace!("[0x{:08x}] Channel finished", id);
    let _ = sender.send(Frame::channel_close(id)).await;
}
