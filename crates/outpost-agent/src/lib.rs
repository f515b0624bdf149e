//! Outpost agent
//!
//! The agent dials out to the server, keeps a notify stream open and serves
//! the sessions the server asks for: multiplexed terminal, file and proxy
//! sessions, one-shot shell commands, and self-upgrades.

pub mod config;
pub mod error;
pub mod file;
pub mod listener;
pub mod proxy;
pub mod pty;
pub mod session;
pub mod shell;
pub mod upgrade;

pub use config::{AgentArgs, AgentConfig};
pub use error::{AgentError, ConfigError};
pub use listener::Agent;
pub use session::{Role, Session, SessionOptions};
