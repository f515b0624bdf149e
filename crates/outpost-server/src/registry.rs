//! Registry of connected agents
//!
//! Every notify stream an agent holds open is one [`AgentInstance`]. Instances
//! sharing a name form an [`Agent`], created when its first instance joins and
//! removed when its last instance leaves. Notifications for "any instance" go
//! to the agent's shared queue and are picked up by whichever instance stream
//! reads first; notifications for one instance go to its private queue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use outpost_proto::{AgentNotify, QUEUE_DEPTH};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::error::TunnelError;

/// All instances sharing one agent name
#[derive(Debug)]
pub struct Agent {
    pub name: String,
    sink: mpsc::Sender<AgentNotify>,
    source: Mutex<mpsc::Receiver<AgentNotify>>,
    count: AtomicUsize,
    instances: DashMap<u64, Arc<AgentInstance>>,
}

impl Agent {
    fn new(name: String) -> Self {
        let (sink, source) = mpsc::channel(QUEUE_DEPTH);
        Self {
            name,
            sink,
            source: Mutex::new(source),
            count: AtomicUsize::new(0),
            instances: DashMap::new(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        let mut list: Vec<_> = self.instances.iter().map(|i| i.info()).collect();
        list.sort_by_key(|info| info.id);
        list
    }
}

/// One connected notify stream of an agent
#[derive(Debug)]
pub struct AgentInstance {
    pub id: u64,
    pub name: String,
    pub user_agent: String,
    pub is_upgradable: bool,
    pub joined_at: DateTime<Utc>,
    pub remote_addr: String,
    sink: mpsc::Sender<AgentNotify>,
}

impl AgentInstance {
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id,
            name: self.name.clone(),
            user_agent: self.user_agent.clone(),
            is_upgradable: self.is_upgradable,
            join_at: self.joined_at,
            remote_addr: self.remote_addr.clone(),
        }
    }
}

/// Listing form of an [`AgentInstance`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub id: u64,
    pub name: String,
    pub user_agent: String,
    pub is_upgradable: bool,
    pub join_at: DateTime<Utc>,
    pub remote_addr: String,
}

/// Where a notification for a session goes
#[derive(Debug, Clone)]
pub struct NotifyTarget {
    pub agent: Arc<Agent>,
    /// Set when a specific instance was requested
    pub instance: Option<Arc<AgentInstance>>,
    sink: mpsc::Sender<AgentNotify>,
}

impl NotifyTarget {
    pub async fn notify(&self, notify: AgentNotify) -> Result<(), TunnelError> {
        self.sink
            .send(notify)
            .await
            .map_err(|_| TunnelError::AgentGone)
    }
}

/// Registry of agents and their instances
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<Agent>>,
    instances: DashMap<u64, Arc<AgentInstance>>,
    next_id: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new instance; it leaves when the lease is dropped
    pub fn join(
        self: &Arc<Self>,
        name: &str,
        user_agent: &str,
        remote_addr: &str,
    ) -> InstanceLease {
        let agent = {
            let entry = self
                .agents
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Agent::new(name.to_string())));
            entry.count.fetch_add(1, Ordering::SeqCst);
            entry.clone()
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, private) = mpsc::channel(QUEUE_DEPTH);
        let instance = Arc::new(AgentInstance {
            id,
            name: name.to_string(),
            user_agent: user_agent.to_string(),
            is_upgradable: outpost_proto::version::is_upgradable(user_agent),
            joined_at: Utc::now(),
            remote_addr: remote_addr.to_string(),
            sink,
        });

        self.instances.insert(id, instance.clone());
        agent.instances.insert(id, instance.clone());
        info!("new agent: {} (instance_id: {})", name, id);

        InstanceLease {
            registry: self.clone(),
            agent,
            instance,
            private,
        }
    }

    fn leave(&self, agent: &Arc<Agent>, id: u64) {
        self.instances.remove(&id);
        agent.instances.remove(&id);
        info!("agent leave: {} (instance_id: {})", agent.name, id);

        if let Entry::Occupied(entry) = self.agents.entry(agent.name.clone()) {
            if Arc::ptr_eq(entry.get(), agent) && agent.count.fetch_sub(1, Ordering::SeqCst) == 1
            {
                entry.remove();
                info!("last agent leave: {}", agent.name);
            }
        }
    }

    pub fn agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.get(name).map(|agent| agent.clone())
    }

    pub fn instance(&self, id: u64) -> Option<Arc<AgentInstance>> {
        self.instances.get(&id).map(|instance| instance.clone())
    }

    /// Every instance of every agent
    pub fn list(&self) -> Vec<InstanceInfo> {
        let mut list: Vec<_> = self.instances.iter().map(|i| i.info()).collect();
        list.sort_by_key(|info| info.id);
        list
    }

    /// Instances of one agent, empty if unknown
    pub fn list_agent(&self, name: &str) -> Vec<InstanceInfo> {
        self.agent(name)
            .map(|agent| agent.instances())
            .unwrap_or_default()
    }

    /// Resolve the queue a session notification for `name` goes to
    ///
    /// With `instance` only that instance of the agent qualifies.
    pub fn notify_target(
        &self,
        name: &str,
        instance: Option<u64>,
    ) -> Result<NotifyTarget, TunnelError> {
        let agent = self.agent(name).ok_or(TunnelError::AgentNotFound)?;

        match instance {
            None => Ok(NotifyTarget {
                sink: agent.sink.clone(),
                agent,
                instance: None,
            }),
            Some(id) => {
                let instance = agent
                    .instances
                    .get(&id)
                    .map(|instance| instance.clone())
                    .ok_or(TunnelError::AgentNotFound)?;
                Ok(NotifyTarget {
                    sink: instance.sink.clone(),
                    agent,
                    instance: Some(instance),
                })
            }
        }
    }
}

/// Membership of one instance in the registry
///
/// Yields the notifications addressed to the instance or to its agent.
#[derive(Debug)]
pub struct InstanceLease {
    registry: Arc<AgentRegistry>,
    agent: Arc<Agent>,
    instance: Arc<AgentInstance>,
    private: mpsc::Receiver<AgentNotify>,
}

impl InstanceLease {
    pub fn instance(&self) -> &Arc<AgentInstance> {
        &self.instance
    }

    /// Next notification for this instance
    pub async fn next(&mut self) -> Option<AgentNotify> {
        let agent = &self.agent;
        let private = &mut self.private;

        // The lock guards only the shared receiver and makes the instances
        // take turns as its single consumer. No registry state is behind it,
        // and a lease waiting here still takes its private notifications.
        tokio::select! {
            notify = async { agent.source.lock().await.recv().await } => notify,
            notify = private.recv() => notify,
        }
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.registry.leave(&self.agent, self.instance.id);
    }
}

/// Parse an optional `agent_id` parameter; garbage names no instance
pub fn parse_instance_id(agent_id: Option<&str>) -> Result<Option<u64>, TunnelError> {
    match agent_id.map(str::trim) {
        None | Some("") => Ok(None),
        Some(id) => id
            .parse()
            .map(Some)
            .map_err(|_| TunnelError::AgentNotFound),
    }
}
