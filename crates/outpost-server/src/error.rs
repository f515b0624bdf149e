//! Server errors

use std::path::PathBuf;

use thiserror::Error;

/// Failures of a connection to an agent
///
/// Cloned into every caller waiting on the same connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("agent not found")]
    AgentNotFound,

    #[error("{0}")]
    Timeout(&'static str),

    #[error("ping failed. got {0}")]
    PingMismatch(String),

    #[error("connection aborted")]
    Aborted,

    #[error("{0}")]
    Disconnected(String),

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Failures while pairing a session with an agent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("agent not found")]
    AgentNotFound,

    #[error("agent is gone")]
    AgentGone,

    #[error("timeout waiting for the agent to connect")]
    Timeout,
}

impl From<TunnelError> for BrokerError {
    fn from(error: TunnelError) -> Self {
        match error {
            TunnelError::AgentNotFound => BrokerError::AgentNotFound,
            TunnelError::AgentGone => BrokerError::Disconnected(error.to_string()),
            TunnelError::Timeout => BrokerError::Timeout("connection ping timeout"),
        }
    }
}

/// Proxy service registration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("proxy service host already existed")]
    HostExists,

    #[error("service not found")]
    NotFound,

    #[error("invalid host, maybe proxy_server_host is not configured")]
    InvalidHost,

    #[error("target is required")]
    MissingTarget,

    #[error("agent_id or agent_name is required")]
    MissingAgent,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Environment variable {0} not set")]
    Env(String),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
