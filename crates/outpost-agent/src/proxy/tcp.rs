//! TCP channel driver

use outpost_proto::{Frame, TcpOpen, DIAL_FAILED, DIAL_OK, READ_CHUNK_SIZE};
use outpost_transport::{Channel, ChannelKind, ChannelState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::finish;
use crate::session::SessionContext;

/// Register the channel and start its driver
pub async fn open(ctx: &SessionContext, frame: &Frame) {
    let request = match frame.parse_tcp_open() {
        Ok(request) => request,
        Err(e) => return ctx.sender.diagnostic(format!("bad frame: {}", e)).await,
    };

    match ctx.channels.open(request.id, ChannelKind::Tcp) {
        Ok(channel) => {
            ctx.tracker.spawn(drive(channel, request));
        }
        Err(e) => {
            let _ = ctx
                .sender
                .send(Frame::tcp_dial_result(request.id, DIAL_FAILED, &e.to_string()))
                .await;
            ctx.sender
                .diagnostic(format!("tcp proxy 0x{:08x} already opened", request.id))
                .await;
        }
    }
}

async fn drive(mut channel: Channel, request: TcpOpen) {
    let id = request.id;
    let sender = channel.sender().clone();

    let mut socket = match TcpStream::connect((request.address.as_str(), request.port)).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(
                "[0x{:08x}] Dial {}:{} failed: {}",
                id, request.address, request.port, e
            );
            let _ = sender
                .send(Frame::tcp_dial_result(id, DIAL_FAILED, &format!("dial error: {}", e)))
                .await;
            return;
        }
    };

    let local_addr = socket
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    channel.set_state(ChannelState::Open);
    if sender
        .send(Frame::tcp_dial_result(id, DIAL_OK, &local_addr))
        .await
        .is_err()
    {
        return;
    }
    info!(
        "[0x{:08x}] TCP channel open to {}:{}",
        id, request.address, request.port
    );

    let token = channel.token().clone();
    let closing = channel.closing().clone();
    let (mut socket_read, mut socket_write) = socket.split();

    // Peer data to the socket; ends on 0x22 or cancellation. A write the
    // socket does not take is abandoned once the peer closes.
    let to_socket = async {
        let mut total = 0u64;
        while let Some(data) = channel.recv().await {
            let written = tokio::select! {
                biased;
                written = socket_write.write_all(&data) => written,
                _ = closing.cancelled() => {
                    debug!("[0x{:08x}] Closed by peer with a write pending", id);
                    break;
                }
            };
            if written.is_err() {
                break;
            }
            total += data.len() as u64;
        }
        let _ = socket_write.shutdown().await;
        token.cancel();
        total
    };

    // Socket data to the peer; ends on read error or end of stream
    let from_socket = async {
        let mut total = 0u64;
        let mut buffer = [0u8; READ_CHUNK_SIZE];
        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = socket_read.read(&mut buffer) => read,
            };
            match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sender
                        .send(Frame::channel_data(id, &buffer[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    total += n as u64;
                }
            }
        }
        token.cancel();
        total
    };

    let (to_remote, to_peer) = tokio::join!(to_socket, from_socket);
    debug!(
        "[0x{:08x}] TCP channel done, {} bytes out, {} bytes back",
        id, to_remote, to_peer
    );

    finish(channel).await;
}
