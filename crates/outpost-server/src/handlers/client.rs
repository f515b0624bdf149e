//! Endpoints for API clients: listing, exec, pty and upgrade

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use outpost_proto::shell::{self, output};
use outpost_proto::upgrade::{self, reply, CHUNK_SIZE};
use outpost_proto::{AgentNotify, Frame, NotifyKind};
use outpost_transport::{FrameReceiver, FrameSender, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

use super::{api_error, ApiError};
use crate::error::TunnelError;
use crate::hub::PendingSession;
use crate::models::{ExecParams, InstanceParams};
use crate::registry::{parse_instance_id, AgentInstance, InstanceInfo};
use crate::server::AppState;

/// `GET /api/client/`
pub async fn list_all(State(state): State<Arc<AppState>>) -> Json<Vec<InstanceInfo>> {
    Json(state.hub.registry.list())
}

/// `GET /api/client/{agent_name}/`
pub async fn list_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_name): Path<String>,
) -> Json<Vec<InstanceInfo>> {
    Json(state.hub.registry.list_agent(&agent_name))
}

fn instance_param(agent_id: Option<&str>) -> Result<Option<u64>, ApiError> {
    parse_instance_id(agent_id).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

/// Notify the agent, mapping failures to HTTP errors
async fn request_session(
    state: &AppState,
    agent_name: &str,
    instance: Option<u64>,
    notify: AgentNotify,
) -> Result<PendingSession, ApiError> {
    state
        .hub
        .request_session(agent_name, instance, notify)
        .await
        .map_err(|e| match e {
            TunnelError::AgentNotFound => api_error(StatusCode::BAD_REQUEST, e.to_string()),
            _ => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        })
}

/// `GET|POST /api/client/{agent_name}/exec`: run a shell command on the agent
///
/// Stdin comes from the `stdin` parameter or else the request body. The
/// response streams stdout (and stderr when asked); with `full=1` every raw
/// frame from the agent is written with a `u32` little-endian length prefix.
pub async fn exec(
    State(state): State<Arc<AppState>>,
    Path(agent_name): Path<String>,
    Query(params): Query<ExecParams>,
    request: Request,
) -> Result<Response, ApiError> {
    if params.cmd.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "cmd is required"));
    }
    let instance = instance_param(params.agent_id.as_deref())?;

    let stdin = match params.stdin.as_deref() {
        Some(data) if !data.is_empty() => Stdin::Literal(Bytes::copy_from_slice(data.as_bytes())),
        _ if has_body(request.headers()) => Stdin::Body(request.into_body()),
        _ => Stdin::None,
    };

    let full = params.want_full();
    let need_stdout = params.want_stdout();
    let need_stderr = params.want_stderr();

    let mut notify = AgentNotify::shell("", params.cmd.clone());
    notify.has_stdin = !matches!(stdin, Stdin::None);
    notify.need_stdout = need_stdout || full;
    notify.need_stderr = need_stderr || full;

    let bound = state.hub.rendezvous.ttl();
    let transport = request_session(&state, &agent_name, instance, notify)
        .await?
        .connect(bound)
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e.to_string()))?;

    info!("[agent '{}'] exec: {}", agent_name, params.cmd);
    let guard = transport.cancel_token().clone().drop_guard();
    let (sender, receiver) = transport.split();
    tokio::spawn(feed_stdin(sender, stdin));

    let output = ExecOutput {
        agent_name,
        receiver,
        full,
        need_stdout,
        need_stderr,
        _guard: guard,
    };
    let body = futures_util::stream::unfold(output, |mut output| async move {
        let chunk = output.next_chunk().await?;
        Some((Ok::<Bytes, Infallible>(chunk), output))
    });

    Ok((
        [
            ("X-Accel-Buffering", "no"),
            (header::CONTENT_DISPOSITION.as_str(), "attachment"),
            (header::CACHE_CONTROL.as_str(), "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

enum Stdin {
    None,
    Literal(Bytes),
    Body(Body),
}

fn has_body(headers: &HeaderMap) -> bool {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    content_length > 0 || headers.contains_key(header::TRANSFER_ENCODING)
}

/// Send stdin to the command, then always close it
async fn feed_stdin(sender: FrameSender, stdin: Stdin) {
    match stdin {
        Stdin::None => {}
        Stdin::Literal(data) => {
            let _ = sender.send(shell::stdin(&data)).await;
        }
        Stdin::Body(body) => {
            let mut chunks = body.into_data_stream();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => {
                        if sender.send(shell::stdin(&chunk)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Failed to read exec stdin: {}", e);
                        break;
                    }
                }
            }
        }
    }
    let _ = sender.send(shell::close_stdin()).await;
}

struct ExecOutput {
    agent_name: String,
    receiver: FrameReceiver,
    full: bool,
    need_stdout: bool,
    need_stderr: bool,
    _guard: DropGuard,
}

impl ExecOutput {
    /// Next bytes for the response body, `None` when the session ended
    async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            let frame = self.receiver.recv().await?;

            match frame.opcode {
                output::EXIT => match shell::parse_exit(&frame) {
                    Ok(code) => info!("[agent '{}'] exit code: {}", self.agent_name, code),
                    Err(e) => warn!("[agent '{}'] bad exit frame: {}", self.agent_name, e),
                },
                output::DEBUG => {
                    debug!("[agent '{}'] debug: {}", self.agent_name, frame.text())
                }
                _ => {}
            }

            if self.full {
                let encoded = frame.encode();
                let mut chunk = Vec::with_capacity(4 + encoded.len());
                chunk.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                chunk.extend_from_slice(&encoded);
                return Some(Bytes::from(chunk));
            }

            match frame.opcode {
                output::STDOUT if self.need_stdout => return Some(frame.payload),
                output::STDERR if self.need_stderr => return Some(frame.payload),
                _ => {}
            }
        }
    }
}

/// `GET /api/client/{agent_name}/pty`: WebSocket bridged to a pty session
///
/// Binary messages carry raw frames in both directions.
pub async fn pty(
    State(state): State<Arc<AppState>>,
    Path(agent_name): Path<String>,
    Query(params): Query<InstanceParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let instance = instance_param(params.agent_id.as_deref())?;
    let pending = request_session(
        &state,
        &agent_name,
        instance,
        AgentNotify::new(NotifyKind::Pty, ""),
    )
    .await?;
    let bound = state.hub.rendezvous.ttl();

    Ok(ws.on_upgrade(move |mut socket| async move {
        match pending.connect(bound).await {
            Ok(transport) => bridge_pty(socket, transport, &agent_name).await,
            Err(e) => {
                warn!("[agent '{}'] pty session failed: {}", agent_name, e);
                let _ = socket.send(Message::Text(e.to_string().into())).await;
                let _ = socket.close().await;
            }
        }
    }))
}

async fn bridge_pty(socket: WebSocket, transport: Transport, agent_name: &str) {
    info!("[agent '{}'] pty session started", agent_name);
    let (sender, mut receiver) = transport.split();
    let (mut sink, mut source) = socket.split();

    let to_client = async {
        while let Some(frame) = receiver.recv().await {
            if sink.send(Message::Binary(frame.encode())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    };

    let to_agent = async {
        while let Some(Ok(message)) = source.next().await {
            let data = match message {
                Message::Binary(data) => data,
                Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            match Frame::decode(data) {
                Ok(frame) => {
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!("[agent '{}'] bad pty frame from client: {}", agent_name, e),
            }
        }
    };

    tokio::select! {
        _ = to_client => {}
        _ = to_agent => {}
    }

    sender.close();
    info!("[agent '{}'] pty session closed", agent_name);
}

/// `POST /api/client/{agent_name}/upgrade?agent_id=`: replace the agent's
/// executable with this server's, reporting progress as server-sent events
pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(agent_name): Path<String>,
    Query(params): Query<InstanceParams>,
) -> Result<Response, ApiError> {
    let not_found = || {
        api_error(
            StatusCode::BAD_REQUEST,
            "agent not found. make sure agent_id is correct",
        )
    };

    let id = instance_param(params.agent_id.as_deref())?.ok_or_else(not_found)?;
    let instance = state
        .hub
        .resolve(&agent_name, Some(id))
        .ok()
        .flatten()
        .ok_or_else(not_found)?;

    let (tx, rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let progress = Progress { tx };
        if let Err(line) = run_upgrade(&state, &agent_name, instance, &progress).await {
            warn!("[agent '{}'] upgrade failed: {}", agent_name, line);
            progress.line(format!("error: {}", line)).await;
        }
    });

    let body = futures_util::stream::unfold(rx, |mut rx| async move {
        let line = rx.recv().await?;
        let event = Bytes::from(format!("data: {}\n\n", line));
        Some((Ok::<Bytes, Infallible>(event), rx))
    });

    Ok((
        [
            (header::CONTENT_TYPE.as_str(), "text/event-stream"),
            (header::CACHE_CONTROL.as_str(), "no-cache"),
            ("X-Accel-Buffering", "no"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

struct Progress {
    tx: mpsc::Sender<String>,
}

impl Progress {
    async fn line(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into()).await;
    }

    fn abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_upgrade(
    state: &AppState,
    agent_name: &str,
    instance: Arc<AgentInstance>,
    progress: &Progress,
) -> Result<(), String> {
    let info = serde_json::to_string(&instance.info()).map_err(|e| e.to_string())?;
    progress.line(format!("agent_info: {}", info)).await;
    if !instance.is_upgradable {
        return Err("agent is not upgradable".to_string());
    }

    let executable = match &state.config.upgrade_executable {
        Some(path) => tokio::fs::read(path).await,
        None => match std::env::current_exe() {
            Ok(path) => tokio::fs::read(path).await,
            Err(e) => Err(e),
        },
    }
    .map_err(|e| format!("cannot get self executable file: {}", e))?;

    let bound = state.hub.rendezvous.ttl();
    let transport = state
        .hub
        .request_session(
            agent_name,
            Some(instance.id),
            AgentNotify::new(NotifyKind::Upgrade, ""),
        )
        .await
        .map_err(|e| e.to_string())?
        .connect(bound)
        .await
        .map_err(|e| e.to_string())?;

    let (sender, mut receiver) = transport.split();
    let result = send_executable(&sender, &mut receiver, &executable, progress).await;
    sender.close();
    result
}

async fn send_executable(
    sender: &FrameSender,
    receiver: &mut FrameReceiver,
    executable: &[u8],
    progress: &Progress,
) -> Result<(), String> {
    let send = |frame: Frame| async move {
        sender
            .send(frame)
            .await
            .map_err(|e| format!("send to agent, {}", e))
    };

    send(upgrade::ready()).await?;
    let path = expect_reply(receiver, 1, reply::PATH, "wait for ready").await?;
    progress
        .line(format!("remote executable path: {}", path.text()))
        .await;

    let total = executable.len() as u64;
    send(upgrade::size(total)).await?;
    progress.line("start send chunks").await;

    let mut offset = 0u64;
    for chunk in executable.chunks(CHUNK_SIZE) {
        if progress.abandoned() {
            return Err("client went away".to_string());
        }

        send(upgrade::chunk(offset, chunk)).await?;
        offset += chunk.len() as u64;

        let ack = expect_reply(receiver, 9, reply::ACK, "remote write chunk").await?;
        let written = upgrade::parse_u64(&ack)
            .map_err(|_| "remote write chunk, got bad package".to_string())?;
        if written != offset {
            return Err(format!(
                "remote cannot write executable file, offset mismatch: {} != {}",
                written, offset
            ));
        }
        progress
            .line(format!(
                "remote wrote chunk: {}, percentage: {:.2}%",
                written,
                written as f64 / total as f64 * 100.0
            ))
            .await;
    }

    expect_reply(receiver, 1, reply::DONE, "recv done").await?;
    progress.line("remote finish recv").await;

    expect_reply(receiver, 1, reply::STARTED, "remote started new executable").await?;
    progress.line("remote started new executable").await;
    Ok(())
}

/// Next frame of the upgrade handshake, which must start with `opcode` and be
/// at least `min_len` bytes long encoded
async fn expect_reply(
    receiver: &mut FrameReceiver,
    min_len: usize,
    opcode: u8,
    stage: &str,
) -> Result<Frame, String> {
    let Some(frame) = receiver.recv().await else {
        return Err(format!("{}, got nothing", stage));
    };
    if frame.opcode == reply::ERROR {
        return Err(format!("{}, got error: {}", stage, frame.text()));
    }
    if frame.len() < min_len || frame.opcode != opcode {
        return Err(format!("{}, got bad package", stage));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_has_body() {
        let mut headers = HeaderMap::new();
        assert!(!has_body(&headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!has_body(&headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert!(has_body(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert!(has_body(&headers));
    }

    fn progress() -> (Progress, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (Progress { tx }, rx)
    }

    async fn lines(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// Answers like an agent whose disk write lags by `skew` bytes
    async fn fake_agent(mut agent: Transport, total: u64, skew: u64) {
        let _ready = agent.recv().await.unwrap();
        agent.send(upgrade::path("/opt/outpost")).await.unwrap();
        let _size = agent.recv().await.unwrap();
        while let Some(frame) = agent.recv().await {
            let (offset, data) = upgrade::parse_chunk(&frame).unwrap();
            let received = offset + data.len() as u64;
            agent.send(upgrade::ack(received - skew)).await.unwrap();
            if received >= total {
                break;
            }
        }
        agent.send(upgrade::done()).await.unwrap();
        agent.send(upgrade::started()).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_executable_reports_progress() {
        let (server, agent) = Transport::memory_pair();
        let executable = vec![7u8; CHUNK_SIZE + CHUNK_SIZE / 2];
        tokio::spawn(fake_agent(agent, executable.len() as u64, 0));

        let (progress, rx) = progress();
        let (sender, mut receiver) = server.split();
        send_executable(&sender, &mut receiver, &executable, &progress)
            .await
            .unwrap();
        drop(progress);

        let lines = lines(rx).await;
        assert_eq!(lines[0], "remote executable path: /opt/outpost");
        assert_eq!(lines[1], "start send chunks");
        assert_eq!(lines[2], "remote wrote chunk: 1048576, percentage: 66.67%");
        assert_eq!(lines[3], "remote wrote chunk: 1572864, percentage: 100.00%");
        assert_eq!(lines[4], "remote finish recv");
        assert_eq!(lines[5], "remote started new executable");
    }

    #[tokio::test]
    async fn test_send_executable_offset_mismatch() {
        let (server, agent) = Transport::memory_pair();
        tokio::spawn(fake_agent(agent, 3, 1));

        let (progress, _rx) = progress();
        let (sender, mut receiver) = server.split();
        let error = send_executable(&sender, &mut receiver, &[1, 2, 3], &progress)
            .await
            .unwrap_err();
        assert_eq!(
            error,
            "remote cannot write executable file, offset mismatch: 2 != 3"
        );
    }

    #[tokio::test]
    async fn test_expect_reply_stages() {
        let (server, agent) = Transport::memory_pair();
        let (_sender, mut receiver) = server.split();

        agent.send(upgrade::error("disk full")).await.unwrap();
        assert_eq!(
            expect_reply(&mut receiver, 1, reply::DONE, "recv done")
                .await
                .unwrap_err(),
            "recv done, got error: disk full"
        );

        agent.send(upgrade::started()).await.unwrap();
        assert_eq!(
            expect_reply(&mut receiver, 1, reply::DONE, "recv done")
                .await
                .unwrap_err(),
            "recv done, got bad package"
        );

        agent.close();
        assert_eq!(
            expect_reply(&mut receiver, 1, reply::DONE, "recv done")
                .await
                .unwrap_err(),
            "recv done, got nothing"
        );
    }
}
