//! Agent configuration: command line, YAML file and environment

use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

/// Command-line options of the agent
#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// Agent name; instances sharing a name form one agent
    #[arg(long, env = "OUTPOST_AGENT_NAME")]
    pub name: Option<String>,

    /// Server base URL (e.g., https://outpost.example.com)
    #[arg(long, env = "OUTPOST_BASE_URL")]
    pub base_url: Option<String>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    pub insecure: bool,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default)]
    pub insecure: bool,
}

/// Validated agent configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub name: String,
    /// `http(s)://host[:port]` without a trailing slash
    pub base_url: String,
    pub insecure: bool,
}

impl AgentConfig {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        insecure: bool,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::Missing("name"));
        }

        let base_url = validate_base_url(&base_url.into())?;

        Ok(Self {
            name,
            base_url,
            insecure,
        })
    }

    /// Merge CLI args with the config file, giving precedence to CLI args
    pub fn from_args(args: AgentArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                load_config_file(path)?
            }
            None => AgentConfigFile::default(),
        };

        let name = args
            .name
            .or(file.name)
            .ok_or(ConfigError::Missing("name"))?;
        let base_url = args
            .base_url
            .or(file.base_url)
            .ok_or(ConfigError::Missing("base_url"))?;

        Self::new(
            resolve_env(name)?,
            resolve_env(base_url)?,
            args.insecure || file.insecure,
        )
    }

    /// Notify stream endpoint
    pub fn notify_url(&self) -> String {
        format!("{}/api/agent/{}", self.base_url, self.name)
    }

    /// WebSocket endpoint a session dials back with its rendezvous token
    pub fn session_url(&self, token: &str) -> String {
        to_ws_url(&format!("{}/api/agent/{}/{}", self.base_url, self.name, token))
    }
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<AgentConfigFile, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace a `$NAME` value with the content of environment variable `NAME`
pub fn resolve_env(value: String) -> Result<String, ConfigError> {
    match value.strip_prefix('$') {
        Some(var) => std::env::var(var).map_err(|_| ConfigError::Env(var.to_string())),
        None => Ok(value),
    }
}

/// Rewrite an `http(s)://` URL to `ws(s)://`
pub fn to_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

fn validate_base_url(base_url: &str) -> Result<String, ConfigError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let parsed = url::Url::parse(trimmed).map_err(|e| ConfigError::Invalid {
        field: "base_url",
        reason: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            field: "base_url",
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }

    if trimmed.ends_with("/api") {
        return Err(ConfigError::Invalid {
            field: "base_url",
            reason: "must not include the /api suffix".to_string(),
        });
    }

    Ok(trimmed.to_string())
}
