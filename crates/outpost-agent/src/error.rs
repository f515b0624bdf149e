//! Agent errors

use std::path::PathBuf;

use outpost_proto::NotifyError;
use outpost_transport::TransportError;
use thiserror::Error;

/// Errors of the agent runtime
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notify stream error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Notify stream rejected with status {0}")]
    Rejected(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
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

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Environment variable {0} not set")]
    Env(String),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
