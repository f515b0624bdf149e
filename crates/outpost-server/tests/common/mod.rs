//! Shared helpers for server integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use outpost_agent::{Agent, AgentConfig};
use outpost_server::{AppState, Server, ServerConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// A server on an ephemeral local port
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    pub async fn with_api_key(api_key: &str) -> Self {
        Self::start_with(ServerConfig {
            api_key: api_key.to_string(),
            ..Default::default()
        })
        .await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Server::new(config).unwrap();
        let state = server.state().clone();
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        });

        Self {
            addr,
            state,
            shutdown,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Start an agent against this server and wait until it registered
    pub async fn spawn_agent(&self, name: &str) -> TestAgent {
        let before = self.state.hub.registry.list_agent(name).len();

        let config = AgentConfig::new(name, self.base_url(), false).unwrap();
        let agent = Agent::new(config).unwrap();
        let stop = agent.stop_token();
        let task = tokio::spawn(async move { agent.run().await });

        tokio::time::timeout(WAIT, async {
            while self.state.hub.registry.list_agent(name).len() <= before {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("agent did not register");

        TestAgent { stop, task }
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(WAIT, self.task).await;
    }
}

/// A running agent
pub struct TestAgent {
    pub stop: CancellationToken,
    pub task: JoinHandle<()>,
}

impl TestAgent {
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(15), self.task).await;
    }
}
