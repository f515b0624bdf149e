//! Session requests: notify an agent and wait for its dial-back

use std::sync::Arc;
use std::time::Duration;

use outpost_proto::AgentNotify;
use outpost_transport::Transport;
use tracing::debug;

use crate::error::TunnelError;
use crate::registry::{AgentInstance, AgentRegistry};
use crate::rendezvous::{Rendezvous, TunnelTicket};

/// The agent registry and the rendezvous table, shared by every handler
#[derive(Debug, Clone, Default)]
pub struct AgentHub {
    pub registry: Arc<AgentRegistry>,
    pub rendezvous: Rendezvous,
}

/// A notified session waiting for the agent's transport
#[derive(Debug)]
pub struct PendingSession {
    pub ticket: TunnelTicket,
    pub instance: Option<Arc<AgentInstance>>,
}

impl PendingSession {
    pub async fn connect(self, bound: Duration) -> Result<Transport, TunnelError> {
        self.ticket.wait(bound).await
    }
}

impl AgentHub {
    pub fn new(registry: Arc<AgentRegistry>, rendezvous: Rendezvous) -> Self {
        Self {
            registry,
            rendezvous,
        }
    }

    /// Resolve the target without notifying it yet
    pub fn resolve(
        &self,
        agent_name: &str,
        instance: Option<u64>,
    ) -> Result<Option<Arc<AgentInstance>>, TunnelError> {
        self.registry
            .notify_target(agent_name, instance)
            .map(|target| target.instance)
    }

    /// Ask `agent_name` (or one of its instances) to dial back for a session
    ///
    /// The notification's id is replaced with a fresh rendezvous token.
    pub async fn request_session(
        &self,
        agent_name: &str,
        instance: Option<u64>,
        mut notify: AgentNotify,
    ) -> Result<PendingSession, TunnelError> {
        let target = self.registry.notify_target(agent_name, instance)?;
        let ticket = self.rendezvous.open(agent_name);
        notify.id = ticket.token().to_string();

        debug!(
            "[agent '{}'] Requesting {:?} session {}",
            agent_name, notify.kind, notify.id
        );

        tokio::time::timeout(self.rendezvous.ttl(), target.notify(notify))
            .await
            .map_err(|_| TunnelError::Timeout)??;

        Ok(PendingSession {
            ticket,
            instance: target.instance,
        })
    }

    /// Notify and wait for the transport in one step
    pub async fn open_session(
        &self,
        agent_name: &str,
        instance: Option<u64>,
        notify: AgentNotify,
    ) -> Result<Transport, TunnelError> {
        let bound = self.rendezvous.ttl();
        self.request_session(agent_name, instance, notify)
            .await?
            .connect(bound)
            .await
    }
}
