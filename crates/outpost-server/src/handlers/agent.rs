//! Endpoints dialed by agents

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use outpost_proto::{AgentNotify, NotifyCodec};
use outpost_transport::Transport;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{api_error, ApiError};
use crate::registry::InstanceLease;
use crate::server::AppState;

/// Interval of keep-alive pings on a notify stream
pub const NOTIFY_PING_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /api/agent/{name}`: the agent's notify stream
///
/// The instance is registered for as long as the response body is alive.
pub async fn notify_stream(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let lease = state.hub.registry.join(&name, &user_agent, &remote_addr);
    info!(
        "Agent '{}' connected from {} ({})",
        name, remote_addr, user_agent
    );

    let stream = NotifyStream {
        lease,
        ping: interval_at(Instant::now() + NOTIFY_PING_INTERVAL, NOTIFY_PING_INTERVAL),
        shutdown: state.shutdown.clone(),
    };
    let body = futures_util::stream::unfold(stream, |mut stream| async move {
        let notify = stream.next().await?;
        match encode_notify(notify) {
            Ok(bytes) => Some((Ok::<Bytes, Infallible>(bytes), stream)),
            Err(e) => {
                error!(
                    "[agent '{}'] Failed to encode notification: {}",
                    stream.lease.instance().name,
                    e
                );
                None
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

struct NotifyStream {
    lease: InstanceLease,
    ping: Interval,
    shutdown: CancellationToken,
}

impl NotifyStream {
    async fn next(&mut self) -> Option<AgentNotify> {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            _ = self.ping.tick() => Some(AgentNotify::ping()),
            notify = self.lease.next() => notify,
        }
    }
}

fn encode_notify(notify: AgentNotify) -> Result<Bytes, outpost_proto::NotifyError> {
    let mut buf = BytesMut::new();
    NotifyCodec.encode(notify, &mut buf)?;
    Ok(buf.freeze())
}

/// `GET /api/agent/{name}/{token}`: a session transport answering a notification
pub async fn tunnel(
    State(state): State<Arc<AppState>>,
    Path((name, token)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if state.hub.registry.agent(&name).is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, "agent not found"));
    }
    let claim = state
        .hub
        .rendezvous
        .take(&name, &token)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "tunnel not found"))?;

    debug!("[agent '{}'] Tunnel {} arrived", name, token);
    Ok(ws.on_upgrade(move |socket| async move {
        let transport = Transport::from_websocket(socket, format!("{}/{}", name, token));
        claim.complete(transport);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_proto::NotifyKind;
    use tokio_util::codec::Decoder;

    #[test]
    fn test_encode_notify_record() {
        let bytes = encode_notify(AgentNotify::new(NotifyKind::Pty, "abc")).unwrap();
        assert!(bytes.ends_with(b"\r\n"));

        let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + length + 2);

        let mut buf = BytesMut::from(bytes.as_ref());
        let decoded = NotifyCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, NotifyKind::Pty);
        assert_eq!(decoded.id, "abc");
    }
}
