//! Outpost server
//!
//! Agents keep a notify stream open to the server and dial back a WebSocket
//! transport for every session it asks for. API clients run commands and
//! terminals on agents through it, and proxy services expose HTTP and
//! WebSocket endpoints reachable only from an agent under virtual hosts.

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod rendezvous;
pub mod server;

pub use broker::{BrokerConfig, ConnectionStatus, ConnectionToAgent};
pub use config::{ServerArgs, ServerConfig};
pub use error::{BrokerError, ConfigError, RegistrationError, TunnelError};
pub use hub::AgentHub;
pub use proxy::{ProxyService, ProxyServices, ServiceSpec};
pub use registry::AgentRegistry;
pub use rendezvous::Rendezvous;
pub use server::{AppState, Server};
