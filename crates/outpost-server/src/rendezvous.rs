//! Tunnel rendezvous: pairing a session request with the agent's dial-back
//!
//! The server opens a ticket, sends its token to the agent in a notification
//! and waits. The agent dials `/api/agent/{name}/{token}`; the handler takes
//! the entry and hands the new transport to the waiting ticket. A token is
//! taken at most once, and entries nobody took within the TTL are swept.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use outpost_transport::Transport;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TunnelError;

/// How long an unclaimed rendezvous entry lives
pub const TUNNEL_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct PendingTunnel {
    agent_name: String,
    tx: oneshot::Sender<Transport>,
    created_at: Instant,
}

/// Pending rendezvous entries keyed by token
#[derive(Debug, Clone)]
pub struct Rendezvous {
    entries: Arc<DashMap<String, PendingTunnel>>,
    ttl: Duration,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new(TUNNEL_TTL)
    }
}

impl Rendezvous {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Allocate a token for a session with `agent_name`
    pub fn open(&self, agent_name: &str) -> TunnelTicket {
        let (tx, rx) = oneshot::channel();
        let mut pending = Some(PendingTunnel {
            agent_name: agent_name.to_string(),
            tx,
            created_at: Instant::now(),
        });

        loop {
            let token = new_token();
            if let Entry::Vacant(entry) = self.entries.entry(token.clone()) {
                if let Some(pending) = pending.take() {
                    entry.insert(pending);
                }
                debug!("Opened tunnel {} for agent '{}'", token, agent_name);
                return TunnelTicket {
                    token,
                    rx: Some(rx),
                    entries: self.entries.clone(),
                };
            }
        }
    }

    /// Claim the entry for `token`, if it belongs to `agent_name`
    pub fn take(&self, agent_name: &str, token: &str) -> Option<TunnelClaim> {
        self.entries
            .remove_if(token, |_, pending| pending.agent_name == agent_name)
            .map(|(token, pending)| TunnelClaim {
                token,
                tx: pending.tx,
            })
    }

    /// Drop entries older than the TTL; their tickets fail with a timeout
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, pending| pending.created_at.elapsed() < ttl);
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            debug!("Swept {} expired tunnel(s)", swept);
        }
        swept
    }

    /// Sweep every half TTL until `cancel` fires
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let rendezvous = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(rendezvous.ttl / 2);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        rendezvous.sweep();
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `{unix seconds:x}-{random:x}`
fn new_token() -> String {
    let unix = chrono::Utc::now().timestamp();
    let nonce = rand::random::<u32>() & 0x7fff_ffff;
    format!("{:x}-{:x}", unix, nonce)
}

/// The waiting side of a rendezvous entry
///
/// Dropping the ticket withdraws the entry.
#[derive(Debug)]
pub struct TunnelTicket {
    token: String,
    rx: Option<oneshot::Receiver<Transport>>,
    entries: Arc<DashMap<String, PendingTunnel>>,
}

impl TunnelTicket {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wait up to `bound` for the agent's transport
    pub async fn wait(mut self, bound: Duration) -> Result<Transport, TunnelError> {
        let rx = self.rx.take().ok_or(TunnelError::Timeout)?;
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(_)) | Err(_) => Err(TunnelError::Timeout),
        }
    }
}

impl Drop for TunnelTicket {
    fn drop(&mut self) {
        self.entries.remove(&self.token);
    }
}

/// The agent side of a claimed rendezvous entry
#[derive(Debug)]
pub struct TunnelClaim {
    pub token: String,
    tx: oneshot::Sender<Transport>,
}

impl TunnelClaim {
    /// Hand the transport over; it is closed if nobody waits anymore
    pub fn complete(self, transport: Transport) {
        if let Err(transport) = self.tx.send(transport) {
            debug!("Tunnel {} abandoned before the agent arrived", self.token);
            transport.close();
        }
    }
}
