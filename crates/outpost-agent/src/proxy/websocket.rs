//! WebSocket channel driver
//!
//! Every 0x21 payload starts with a one-byte message tag (text, binary,
//! close, ping, pong) followed by the message body, in both directions.

use std::borrow::Cow;

use futures_util::{SinkExt, StreamExt};
use outpost_proto::{
    ws_tag, ChannelId, Frame, ProxyHttpHeader, ProxyHttpRequest, ProxyHttpResponse,
};
use outpost_transport::{Channel, ChannelState, ClientWebSocket, WebSocketConfig};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, HOST};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use super::{finish, reply};

/// Handshake headers generated by the local client; forwarded copies are dropped
const HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

/// Build the upstream handshake request
pub fn handshake_request(request: &ProxyHttpRequest) -> Result<Request, String> {
    let mut handshake = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;

    let headers = handshake.headers_mut();
    for header in &request.headers {
        if HANDSHAKE_HEADERS
            .iter()
            .any(|name| header.name.eq_ignore_ascii_case(name))
        {
            continue;
        }
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| e.to_string())?;
        let value = HeaderValue::from_str(&header.value).map_err(|e| e.to_string())?;
        headers.append(name, value);
    }

    if !request.host.is_empty() {
        let host = HeaderValue::from_str(&request.host).map_err(|e| e.to_string())?;
        headers.insert(HOST, host);
    }

    Ok(handshake)
}

/// Tagged channel payload to a WebSocket message
///
/// `None` for an empty payload or an unknown tag.
pub fn to_message(payload: &[u8]) -> Option<Message> {
    let (&tag, body) = payload.split_first()?;
    let message = match tag {
        ws_tag::TEXT => Message::Text(String::from_utf8_lossy(body).into_owned()),
        ws_tag::BINARY => Message::Binary(body.to_vec()),
        ws_tag::PING => Message::Ping(body.to_vec()),
        ws_tag::PONG => Message::Pong(body.to_vec()),
        ws_tag::CLOSE => {
            let frame = (body.len() >= 2).then(|| CloseFrame {
                code: CloseCode::from(u16::from_be_bytes([body[0], body[1]])),
                reason: Cow::Owned(String::from_utf8_lossy(&body[2..]).into_owned()),
            });
            Message::Close(frame)
        }
        _ => return None,
    };
    Some(message)
}

/// WebSocket message to a tagged channel payload
pub fn from_message(message: Message) -> Option<(u8, Vec<u8>)> {
    match message {
        Message::Text(text) => Some((ws_tag::TEXT, text.into_bytes())),
        Message::Binary(data) => Some((ws_tag::BINARY, data)),
        Message::Ping(data) => Some((ws_tag::PING, data)),
        Message::Pong(data) => Some((ws_tag::PONG, data)),
        Message::Close(frame) => {
            let body = frame
                .map(|frame| {
                    let mut body = u16::from(frame.code).to_be_bytes().to_vec();
                    body.extend_from_slice(frame.reason.as_bytes());
                    body
                })
                .unwrap_or_default();
            Some((ws_tag::CLOSE, body))
        }
        Message::Frame(_) => None,
    }
}

pub async fn drive(mut channel: Channel, request: ProxyHttpRequest, config: WebSocketConfig) {
    let id = channel.id();
    let sender = channel.sender().clone();

    let handshake = match handshake_request(&request) {
        Ok(handshake) => handshake,
        Err(e) => {
            let failed = ProxyHttpResponse::failed(format!("bad request: {}", e));
            reply(&sender, id, &failed).await;
            return;
        }
    };

    let (socket, response) = match config.dial(handshake).await {
        Ok(connected) => connected,
        Err(e) => {
            debug!("[0x{:08x}] WebSocket dial {} failed: {}", id, request.url, e);
            let failed = ProxyHttpResponse::failed(format!("connect error: {}", e));
            reply(&sender, id, &failed).await;
            return;
        }
    };

    let dial_result = ProxyHttpResponse {
        connection_error: String::new(),
        status_code: i32::from(response.status().as_u16()),
        headers: response
            .headers()
            .iter()
            .map(|(name, value)| {
                ProxyHttpHeader::new(name.as_str(), String::from_utf8_lossy(value.as_bytes()))
            })
            .collect(),
        is_websocket: true,
    };
    channel.set_state(ChannelState::Open);
    if !reply(&sender, id, &dial_result).await {
        return;
    }
    info!("[0x{:08x}] WebSocket channel open to {}", id, request.url);

    pump(&mut channel, socket, id).await;
    finish(channel).await;
}

async fn pump(channel: &mut Channel, socket: ClientWebSocket, id: ChannelId) {
    let sender = channel.sender().clone();
    let token = channel.token().clone();
    let closing = channel.closing().clone();
    let (mut sink, mut stream) = socket.split();

    // Peer messages to the upstream socket; a send the upstream does not
    // take is abandoned once the peer closes
    let to_upstream = async {
        while let Some(payload) = channel.recv().await {
            let Some(message) = to_message(&payload) else {
                continue;
            };
            let is_close = matches!(message, Message::Close(_));
            let sent = tokio::select! {
                biased;
                sent = sink.send(message) => sent,
                _ = closing.cancelled() => break,
            };
            if sent.is_err() || is_close {
                break;
            }
        }
        let _ = sink.close().await;
        token.cancel();
    };

    // Upstream messages to the peer
    let from_upstream = async {
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = stream.next() => message,
            };
            let Some(Ok(message)) = message else {
                break;
            };
            let Some((tag, body)) = from_message(message) else {
                continue;
            };
            let sent = sender.send(Frame::ws_data(id, tag, &body)).await;
            if sent.is_err() || tag == ws_tag::CLOSE {
                break;
            }
        }
        token.cancel();
    };

    tokio::join!(to_upstream, from_upstream);
    debug!("[0x{:08x}] WebSocket channel done", id);
}
