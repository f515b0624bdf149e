//! HTTP channel driver
//!
//! A plain HTTP request is one-way after the dial result: the response body
//! is streamed to the peer and any 0x22 from the peer aborts it, which is how
//! long-lived streams (server-sent events) are cancelled.

use outpost_proto::{Frame, ProxyHttpHeader, ProxyHttpRequest, ProxyHttpResponse};
use outpost_transport::{Channel, ChannelKind, ChannelState};
use tracing::{debug, info};
use url::Url;

use super::{finish, reply, send_chunked, websocket};
use crate::session::SessionContext;

/// Validate the request, register the channel and start its driver
pub async fn open(ctx: &SessionContext, frame: &Frame) {
    let id = match frame.channel_id() {
        Ok(id) => id,
        Err(e) => return ctx.sender.diagnostic(format!("bad frame: {}", e)).await,
    };

    let request = match frame.parse_http_open() {
        Ok(open) => open.request,
        Err(e) => {
            let failed = ProxyHttpResponse::failed(format!("bad request: {}", e));
            reply(&ctx.sender, id, &failed).await;
            return;
        }
    };

    let url = match Url::parse(&request.url) {
        Ok(url) => url,
        Err(e) => {
            let failed = ProxyHttpResponse::failed(format!("bad url: {}", e));
            reply(&ctx.sender, id, &failed).await;
            return;
        }
    };

    let kind = match url.scheme() {
        "ws" | "wss" => ChannelKind::WebSocket,
        _ => ChannelKind::Http,
    };

    let channel = match ctx.channels.open(id, kind) {
        Ok(channel) => channel,
        Err(e) => {
            reply(&ctx.sender, id, &ProxyHttpResponse::failed(e.to_string())).await;
            return;
        }
    };

    match kind {
        ChannelKind::WebSocket => {
            let config = ctx.websocket.clone();
            ctx.tracker.spawn(websocket::drive(channel, request, config));
        }
        _ => {
            ctx.tracker.spawn(drive(ctx.clone(), channel, request, url));
        }
    }
}

async fn drive(
    ctx: SessionContext,
    mut channel: Channel,
    request: ProxyHttpRequest,
    url: Url,
) {
    if exchange(&ctx, &mut channel, request, url).await {
        finish(channel).await;
    }
}

/// Run the request; true when a dial result went out and the peer expects a
/// close frame
async fn exchange(
    ctx: &SessionContext,
    channel: &mut Channel,
    request: ProxyHttpRequest,
    url: Url,
) -> bool {
    let id = channel.id();
    let sender = channel.sender().clone();

    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => method,
        Err(e) => {
            let failed = ProxyHttpResponse::failed(format!("bad request: {}", e));
            reply(&sender, id, &failed).await;
            return false;
        }
    };

    let mut builder = ctx.http.request(method.clone(), url.clone()).body(request.body);
    for header in &request.headers {
        builder = builder.header(header.name.as_str(), header.value.as_str());
    }
    if !request.host.is_empty() {
        builder = builder.header(reqwest::header::HOST, request.host.as_str());
    }

    channel.set_state(ChannelState::Open);

    let wait_closed = async {
        while channel.recv().await.is_some() {}
    };
    tokio::pin!(wait_closed);

    let sent = tokio::select! {
        _ = &mut wait_closed => {
            debug!("[0x{:08x}] Request aborted by peer before response", id);
            let failed = ProxyHttpResponse::failed("connect error: request aborted");
            reply(&sender, id, &failed).await;
            return false;
        }
        sent = builder.send() => sent,
    };

    let mut response = match sent {
        Ok(response) => response,
        Err(e) => {
            debug!("[0x{:08x}] {} {} failed: {}", id, method, url, e);
            let failed = ProxyHttpResponse::failed(format!("connect error: {}", e));
            reply(&sender, id, &failed).await;
            return false;
        }
    };

    let dial_result = ProxyHttpResponse {
        connection_error: String::new(),
        status_code: i32::from(response.status().as_u16()),
        headers: response_headers(response.headers()),
        is_websocket: false,
    };
    if !reply(&sender, id, &dial_result).await {
        return false;
    }
    info!("[0x{:08x}] {} {} -> {}", id, method, url, response.status());

    let mut total = 0usize;
    loop {
        let chunk = tokio::select! {
            _ = &mut wait_closed => {
                debug!("[0x{:08x}] Response aborted by peer", id);
                break;
            }
            chunk = response.chunk() => chunk,
        };

        match chunk {
            Ok(Some(data)) => {
                if !send_chunked(&sender, id, &data).await {
                    break;
                }
                total += data.len();
            }
            Ok(None) => break,
            Err(e) => {
                debug!("[0x{:08x}] Response body error: {}", id, e);
                break;
            }
        }
    }
    debug!("[0x{:08x}] Streamed {} response bytes", id, total);

    true
}

fn response_headers(headers: &reqwest::header::HeaderMap) -> Vec<ProxyHttpHeader> {
    headers
        .iter()
        .map(|(name, value)| {
            ProxyHttpHeader::new(name.as_str(), String::from_utf8_lossy(value.as_bytes()))
        })
        .collect()
}
