//! Notify listener: the agent's long-lived link to the server
//!
//! The agent holds one streaming GET open and waits for session requests.
//! Each request names a rendezvous token; the agent dials a WebSocket back
//! with that token and serves the requested session on it.

use std::time::Duration;

use futures_util::{StreamExt, TryStreamExt};
use outpost_proto::{version, AgentNotify, NotifyCodec, NotifyKind};
use outpost_transport::{Transport, WebSocketConfig};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::session::{Role, Session, SessionOptions};
use crate::{shell, upgrade};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running agent
pub struct Agent {
    config: AgentConfig,
    http: reqwest::Client,
    websocket: WebSocketConfig,
    user_agent: String,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let user_agent = version::user_agent();
        let http = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .danger_accept_invalid_certs(config.insecure)
            .build()?;
        let websocket = WebSocketConfig {
            insecure: config.insecure,
            user_agent: Some(user_agent.clone()),
        };

        Ok(Self {
            config,
            http,
            websocket,
            user_agent,
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Cancelling this token stops the listener; a finished upgrade does it too
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Listen until stopped, reconnecting with exponential backoff
    pub async fn run(&self) {
        let mut delay = INITIAL_RECONNECT_DELAY;

        info!(
            "[agent '{}'] Listening on {}",
            self.config.name,
            self.config.notify_url()
        );

        while !self.stop.is_cancelled() {
            match self.listen().await {
                Ok(()) => {
                    delay = INITIAL_RECONNECT_DELAY;
                    if self.stop.is_cancelled() {
                        break;
                    }
                    info!("[agent '{}'] Notify stream ended", self.config.name);
                }
                Err(e) => {
                    warn!(
                        "[agent '{}'] Notify stream failed: {}. Reconnecting in {}s",
                        self.config.name,
                        e,
                        delay.as_secs()
                    );
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
        }

        info!("[agent '{}'] Stopped, waiting for sessions", self.config.name);
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("[agent '{}'] Sessions still running at exit", self.config.name);
        }
    }

    /// One notify stream; `Ok` once the stream was established
    async fn listen(&self) -> Result<(), AgentError> {
        let response = self.http.get(self.config.notify_url()).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(AgentError::Rejected(response.status().as_u16()));
        }
        info!("[agent '{}'] Connected to server", self.config.name);

        let body = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        let mut records = FramedRead::new(StreamReader::new(body), NotifyCodec);

        loop {
            let next = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                next = records.next() => next,
            };

            match next {
                Some(Ok(task)) => self.dispatch(task),
                Some(Err(e)) => {
                    warn!("[agent '{}'] Bad notify record: {}", self.config.name, e);
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    fn dispatch(&self, task: AgentNotify) {
        if task.kind == NotifyKind::Ping {
            trace!("[agent '{}'] Ping", self.config.name);
            return;
        }

        debug!(
            "[agent '{}'] {:?} session requested ({})",
            self.config.name, task.kind, task.id
        );

        let url = self.config.session_url(&task.id);
        let websocket = self.websocket.clone();
        let options = SessionOptions {
            insecure: self.config.insecure,
        };
        let stop = self.stop.clone();
        let kind = task.kind;

        self.tracker.spawn(async move {
            let transport = match connect(&websocket, &url).await {
                Some(transport) => transport,
                None => return,
            };

            match kind {
                NotifyKind::Shell => shell::run(transport, task).await,
                NotifyKind::Pty | NotifyKind::Proxy => {
                    let roles = Role::for_session(kind);
                    if let Err(e) = Session::serve(transport, roles, &options).await {
                        error!("Session failed: {}", e);
                    }
                }
                NotifyKind::Upgrade => {
                    if upgrade::run(transport, stop).await.is_ok() {
                        info!("Upgrade complete, handing over to the new executable");
                    }
                }
                NotifyKind::Ping => {}
            }
        });
    }
}

async fn connect(websocket: &WebSocketConfig, url: &str) -> Option<Transport> {
    match websocket.connect(url).await {
        Ok(transport) => Some(transport),
        Err(e) => {
            warn!("Failed to dial session {}: {}", url, e);
            None
        }
    }
}
