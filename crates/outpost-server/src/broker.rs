//! Connection broker: one multiplexed session to an agent, shared by many
//! proxied requests
//!
//! A [`ConnectionToAgent`] asks the agent for a session, checks it with a
//! ping and then serves requests over it. Every request gets its own channel
//! id and inbound queue; a single demux task reads the transport and routes
//! frames to those queues by id. The connection ends for good on transport
//! loss, cancellation or a watchdog timeout, and a new one has to be created.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use outpost_proto::{
    AgentNotify, ChannelId, Frame, NotifyKind, Opcode, ProxyHttpHeader, ProxyHttpRequest,
    ProxyHttpResponse, QUEUE_DEPTH,
};
use outpost_transport::{FrameReceiver, FrameSender, Transport};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::hub::AgentHub;

/// Headers never forwarded in either direction
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "upgrade",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-accept",
];

/// Time bounds of a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Agent dial-back plus ping round trip
    pub ready_timeout: Duration,
    /// Wait for a dial result
    pub dial_timeout: Duration,
    /// Two idle intervals in a row end the connection
    pub watchdog_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(60),
            watchdog_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected(BrokerError),
}

/// A broker connection to one agent
#[derive(Debug)]
pub struct ConnectionToAgent {
    agent_name: String,
    config: BrokerConfig,
    next_id: AtomicU32,
    sender: OnceLock<FrameSender>,
    pending: DashMap<ChannelId, mpsc::Sender<Frame>>,
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
}

impl ConnectionToAgent {
    /// Start connecting to `agent_name`; callers wait with [`Self::wait_ready`]
    ///
    /// Cancelling `parent` ends the connection like a transport loss.
    pub fn connect(
        hub: AgentHub,
        agent_name: &str,
        instance: Option<u64>,
        parent: &CancellationToken,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let connection = Arc::new(Self {
            agent_name: agent_name.to_string(),
            config,
            next_id: AtomicU32::new(0),
            sender: OnceLock::new(),
            pending: DashMap::new(),
            status,
            cancel: parent.child_token(),
        });

        let task = connection.clone();
        tokio::spawn(async move {
            let error = task.communicate(&hub, instance).await;
            task.finish(error);
        });

        connection
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(*self.status.borrow(), ConnectionStatus::Disconnected(_))
    }

    /// Requests currently routed by the demux task
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Wait until the connection is usable or has failed
    ///
    /// Every waiter observes the same outcome.
    pub async fn wait_ready(&self) -> Result<(), BrokerError> {
        let mut status = self.status.subscribe();
        let status = status
            .wait_for(|status| *status != ConnectionStatus::Connecting)
            .await
            .map_err(|_| BrokerError::Disconnected("connection dropped".to_string()))?
            .clone();

        match status {
            ConnectionStatus::Disconnected(error) => Err(error),
            _ => Ok(()),
        }
    }

    /// End the connection
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Runs until the connection is over and returns why
    async fn communicate(&self, hub: &AgentHub, instance: Option<u64>) -> BrokerError {
        let transport = tokio::select! {
            _ = self.cancel.cancelled() => return BrokerError::Aborted,
            result = tokio::time::timeout(self.config.ready_timeout, self.handshake(hub, instance)) => {
                match result {
                    Ok(Ok(transport)) => transport,
                    Ok(Err(error)) => return error,
                    Err(_) => return BrokerError::Timeout("connection ping timeout"),
                }
            }
        };

        let (sender, receiver) = transport.split();
        // Set once per connection
        let _ = self.sender.set(sender.clone());
        self.status.send_replace(ConnectionStatus::Connected);
        info!("[agent '{}'] Proxy connection ready", self.agent_name);

        let error = self.demux(receiver, &sender).await;
        sender.close();
        error
    }

    async fn handshake(
        &self,
        hub: &AgentHub,
        instance: Option<u64>,
    ) -> Result<Transport, BrokerError> {
        let session = hub
            .request_session(
                &self.agent_name,
                instance,
                AgentNotify::new(NotifyKind::Proxy, ""),
            )
            .await?;
        let mut transport = session.connect(self.config.ready_timeout).await?;

        let ping = Frame::ping();
        transport
            .send(ping.clone())
            .await
            .map_err(|e| BrokerError::Disconnected(e.to_string()))?;

        match transport.recv().await {
            Some(pong) if pong == ping => Ok(transport),
            Some(other) => Err(BrokerError::PingMismatch(hex(&other.encode()))),
            None => Err(BrokerError::Disconnected(
                "tunnel from agent closed".to_string(),
            )),
        }
    }

    async fn demux(&self, mut receiver: FrameReceiver, sender: &FrameSender) -> BrokerError {
        let period = self.config.watchdog_interval;
        let mut watchdog = interval_at(Instant::now() + period, period);
        let mut idle = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return BrokerError::Aborted,
                _ = watchdog.tick() => {
                    if idle {
                        return BrokerError::Timeout("watchdog timeout");
                    }
                    idle = true;
                }
                frame = receiver.recv() => {
                    let Some(frame) = frame else {
                        return BrokerError::Disconnected("tunnel from agent closed".to_string());
                    };

                    if frame.is(Opcode::Diagnostic) {
                        info!("[agent '{}'] message: {}", self.agent_name, frame.text());
                        continue;
                    }

                    idle = false;
                    self.route(frame, sender).await;
                }
            }
        }
    }

    /// Deliver a frame to the request owning its channel id
    async fn route(&self, frame: Frame, sender: &FrameSender) {
        let Ok(id) = frame.channel_id() else {
            debug!(
                "[agent '{}'] Dropping short frame 0x{:02x}",
                self.agent_name, frame.opcode
            );
            return;
        };
        let opcode = frame.opcode;

        let queue = self.pending.get(&id).map(|queue| queue.clone());
        if let Some(queue) = queue {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = queue.send(frame) => {
                    if result.is_ok() {
                        return;
                    }
                }
            }
        }

        warn!(
            "[agent '{}'] bad proxy reqId 0x{:x} with package 0x{:02x}",
            self.agent_name, id, opcode
        );
        if opcode != Opcode::ChannelClose.as_u8() {
            let _ = sender.send(Frame::channel_close(id)).await;
        }
    }

    fn finish(&self, error: BrokerError) {
        match &error {
            BrokerError::Aborted => {
                info!("[agent '{}'] Proxy connection closed", self.agent_name)
            }
            _ => warn!(
                "[agent '{}'] Proxy connection lost: {}",
                self.agent_name, error
            ),
        }
        self.cancel.cancel();
        self.pending.clear();
        self.status.send_replace(ConnectionStatus::Disconnected(error));
    }

    /// Open a proxied HTTP or WebSocket request on the agent
    ///
    /// On success the upstream answered; the returned stream carries the
    /// response body or WebSocket messages.
    pub async fn handle_request(
        self: &Arc<Self>,
        mut request: ProxyHttpRequest,
    ) -> Result<ProxyExchange, BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Aborted);
        }
        let sender = self
            .sender
            .get()
            .cloned()
            .ok_or_else(|| BrokerError::Disconnected("not connected".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        info!(
            "[agent '{}'] request {:x}: {} {}",
            self.agent_name, id, request.method, request.url
        );

        request.headers = strip_headers(request.headers);
        let open = Frame::http_open(id, &request)
            .map_err(|e| BrokerError::Connection(format!("bad request: {}", e)))?;

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        self.pending.insert(id, tx);
        let mut stream = ProxyStream {
            id,
            inbound: rx,
            sender,
            connection: self.clone(),
            finished: false,
        };

        stream
            .sender
            .send(open)
            .await
            .map_err(|e| BrokerError::Disconnected(e.to_string()))?;

        let reply = tokio::select! {
            _ = self.cancel.cancelled() => return Err(BrokerError::Aborted),
            reply = tokio::time::timeout(self.config.dial_timeout, stream.inbound.recv()) => {
                match reply {
                    Ok(Some(reply)) => reply,
                    Ok(None) => return Err(BrokerError::Aborted),
                    Err(_) => return Err(BrokerError::Timeout("timeout")),
                }
            }
        };

        if !reply.is(Opcode::HttpOpen) {
            return Err(BrokerError::BadResponse("expect 0x23 package".to_string()));
        }
        let mut response = reply
            .parse_http_dial_result()
            .map_err(|e| BrokerError::BadResponse(e.to_string()))?
            .response;

        if !response.is_ok() {
            // Failed dials were never registered on the agent
            stream.finished = true;
            return Err(BrokerError::Connection(response.connection_error));
        }

        if response.is_websocket {
            response.headers = strip_headers(response.headers);
        }

        Ok(ProxyExchange { response, stream })
    }
}

/// Result of a successful dial
#[derive(Debug)]
pub struct ProxyExchange {
    pub response: ProxyHttpResponse,
    pub stream: ProxyStream,
}

/// One proxied request's channel on the agent connection
///
/// Dropping an unfinished stream closes the channel on the agent.
#[derive(Debug)]
pub struct ProxyStream {
    id: ChannelId,
    inbound: mpsc::Receiver<Frame>,
    sender: FrameSender,
    connection: Arc<ConnectionToAgent>,
    finished: bool,
}

impl ProxyStream {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Next data payload, `None` once the agent closed the channel or the
    /// connection ended
    ///
    /// WebSocket payloads still start with their message-type tag.
    pub async fn next_data(&mut self) -> Option<Bytes> {
        loop {
            let frame = tokio::select! {
                _ = self.connection.cancel.cancelled() => return None,
                frame = self.inbound.recv() => frame?,
            };

            match frame.kind() {
                Some(Opcode::ChannelData) => match frame.parse_channel_data() {
                    Ok(data) => return Some(data.data),
                    Err(e) => debug!("Bad channel data: {}", e),
                },
                Some(Opcode::ChannelClose) => {
                    self.finished = true;
                    return None;
                }
                _ => debug!(
                    "[0x{:08x}] Ignoring frame 0x{:02x}",
                    self.id, frame.opcode
                ),
            }
        }
    }

    pub async fn send_ws(&self, tag: u8, data: &[u8]) -> bool {
        self.sender
            .send(Frame::ws_data(self.id, tag, data))
            .await
            .is_ok()
    }

    /// Close the channel on the agent
    pub async fn close(mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.sender.send(Frame::channel_close(self.id)).await;
        }
    }

    /// A handle that can only send on this channel
    pub fn writer(&self) -> ProxyStreamWriter {
        ProxyStreamWriter {
            id: self.id,
            sender: self.sender.clone(),
        }
    }
}

impl Drop for ProxyStream {
    fn drop(&mut self) {
        self.connection.pending.remove(&self.id);

        if self.finished || self.sender.is_closed() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let sender = self.sender.clone();
            let id = self.id;
            debug!("[0x{:08x}] Aborted by client", id);
            runtime.spawn(async move {
                let _ = sender.send(Frame::channel_close(id)).await;
            });
        }
    }
}

/// Sending half of a [`ProxyStream`]
#[derive(Debug, Clone)]
pub struct ProxyStreamWriter {
    id: ChannelId,
    sender: FrameSender,
}

impl ProxyStreamWriter {
    pub async fn send_ws(&self, tag: u8, data: &[u8]) -> bool {
        self.sender
            .send(Frame::ws_data(self.id, tag, data))
            .await
            .is_ok()
    }
}

/// Drop hop-by-hop and WebSocket handshake headers
pub fn strip_headers(headers: Vec<ProxyHttpHeader>) -> Vec<ProxyHttpHeader> {
    headers
        .into_iter()
        .filter(|header| {
            let name = header.name.to_ascii_lowercase();
            !STRIPPED_HEADERS.contains(&name.as_str())
        })
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
