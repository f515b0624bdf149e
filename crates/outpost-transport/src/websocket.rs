//! WebSocket adapter: one WebSocket connection becomes one [`Transport`]
//!
//! Each binary (or text) message carries exactly one frame. A writer task
//! drains the outbound queue into the socket and a reader task decodes inbound
//! messages into the inbound queue. Either task ending cancels the transport.

use std::fmt::Display;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use outpost_proto::{Frame, QUEUE_DEPTH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::transport::{FrameSender, Transport};

/// What a received WebSocket message means to the transport
#[derive(Debug)]
pub enum WsEvent {
    Data(Bytes),
    Close,
    Control,
}

/// WebSocket message types the adapter can carry frames over
pub trait WsMessage: Send + Sized + 'static {
    fn binary(data: Bytes) -> Self;

    fn into_event(self) -> WsEvent;
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Bytes) -> Self {
        Self::Binary(data.to_vec())
    }

    fn into_event(self) -> WsEvent {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Binary(data) => WsEvent::Data(Bytes::from(data)),
            Message::Text(text) => WsEvent::Data(Bytes::from(text.into_bytes())),
            Message::Close(_) => WsEvent::Close,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => WsEvent::Control,
        }
    }
}

#[cfg(feature = "axum")]
impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn into_event(self) -> WsEvent {
        use axum::extract::ws::Message;
        match self {
            Message::Binary(data) => WsEvent::Data(data),
            Message::Text(text) => WsEvent::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Message::Close(_) => WsEvent::Close,
            Message::Ping(_) | Message::Pong(_) => WsEvent::Control,
        }
    }
}

impl Transport {
    /// Wrap an established WebSocket connection
    ///
    /// `label` prefixes every log line of this connection.
    pub fn from_websocket<S, M, E>(socket: S, label: impl Into<String>) -> Transport
    where
        S: Stream<Item = Result<M, E>> + Sink<M> + Send + 'static,
        <S as Sink<M>>::Error: Display + Send,
        M: WsMessage,
        E: Display + Send + 'static,
    {
        let label = label.into();
        let cancel = CancellationToken::new();
        let (sink, source) = socket.split();

        let (out_tx, out_rx) = mpsc::channel::<Frame>(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(QUEUE_DEPTH);

        let reply = FrameSender::new(out_tx.clone(), cancel.clone());

        tokio::spawn(writer_task(sink, out_rx, cancel.clone(), label.clone()));
        tokio::spawn(reader_task(source, in_tx, reply, cancel.clone(), label));

        Transport::from_parts(out_tx, in_rx, cancel)
    }
}

/// Writer task - sends frames to the WebSocket
///
/// Frames already queued when the transport is cancelled are still flushed.
async fn writer_task<K, M>(
    mut sink: K,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    label: String,
) where
    K: Sink<M> + Unpin,
    K::Error: Display + Send,
    M: WsMessage,
{
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(M::binary(frame.encode())).await {
                    error!("[{}] WebSocket send error: {}", label, e);
                    break;
                }
            }
            _ = cancel.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if sink.send(M::binary(frame.encode())).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    debug!("[{}] WebSocket writer task ended", label);
    cancel.cancel();
    let _ = sink.close().await;
}

/// Reader task - decodes WebSocket messages into frames
async fn reader_task<R, M, E>(
    mut source: R,
    tx: mpsc::Sender<Frame>,
    reply: FrameSender,
    cancel: CancellationToken,
    label: String,
) where
    R: Stream<Item = Result<M, E>> + Unpin,
    M: WsMessage,
    E: Display + Send + 'static,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = source.next() => message,
        };

        match message.map(|m| m.map(M::into_event)) {
            Some(Ok(WsEvent::Data(data))) => match Frame::decode(data) {
                Ok(frame) => {
                    trace!(
                        "[{}] Received frame: opcode=0x{:02x}, len={}",
                        label,
                        frame.opcode,
                        frame.payload.len()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = tx.send(frame) => {
                            if result.is_err() {
                                debug!("[{}] Inbound queue dropped", label);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("[{}] Invalid frame received: {}", label, e);
                    reply.diagnostic(format!("bad frame: {}", e)).await;
                }
            },
            Some(Ok(WsEvent::Control)) => {
                trace!("[{}] Received control message", label);
            }
            Some(Ok(WsEvent::Close)) => {
                debug!("[{}] WebSocket close received", label);
                break;
            }
            Some(Err(e)) => {
                debug!("[{}] WebSocket read error: {}", label, e);
                break;
            }
            None => break,
        }
    }

    debug!("[{}] WebSocket reader task ended", label);
    cancel.cancel();
}
