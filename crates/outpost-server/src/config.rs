//! Server configuration: command line, YAML file and environment

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

const DEFAULT_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;

/// Command-line options of the server
#[derive(Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Server name, shown in logs
    #[arg(long, env = "OUTPOST_SERVER_NAME")]
    pub name: Option<String>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "OUTPOST_ADDR")]
    pub addr: Option<String>,

    /// Bind port [default: 8080]
    #[arg(long, short = 'p', env = "OUTPOST_PORT")]
    pub port: Option<u16>,

    /// API key required by client and proxy endpoints
    #[arg(long, env = "OUTPOST_API_KEY")]
    pub api_key: Option<String>,

    /// Host template of proxy services, e.g. "*.proxy.example.com"
    #[arg(long, env = "OUTPOST_PROXY_SERVER_HOST")]
    pub proxy_server_host: Option<String>,

    /// Executable sent to upgrading agents [default: this executable]
    #[arg(long, env = "OUTPOST_UPGRADE_EXECUTABLE")]
    pub upgrade_executable: Option<PathBuf>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

/// A proxy service registered at start-up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyServiceConfig {
    pub host: String,
    pub agent_name: String,
    pub target: String,
    #[serde(default)]
    pub replace_host: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_server_host: Option<String>,

    #[serde(default)]
    pub proxy_services: Vec<ProxyServiceConfig>,
}

/// Validated server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub addr: String,
    pub port: u16,
    /// Empty disables the API key check
    pub api_key: String,
    pub proxy_server_host: Option<String>,
    pub proxy_services: Vec<ProxyServiceConfig>,
    /// Executable shipped to upgrading agents; the running one when unset
    pub upgrade_executable: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "outpost".to_string(),
            addr: DEFAULT_ADDR.to_string(),
            port: DEFAULT_PORT,
            api_key: String::new(),
            proxy_server_host: None,
            proxy_services: Vec::new(),
            upgrade_executable: None,
        }
    }
}

impl ServerConfig {
    /// Merge CLI args with the config file, giving precedence to CLI args
    pub fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                load_config_file(path)?
            }
            None => ServerConfigFile::default(),
        };

        let defaults = ServerConfig::default();

        let proxy_services = file
            .proxy_services
            .into_iter()
            .map(|service| {
                Ok(ProxyServiceConfig {
                    host: resolve_env(service.host)?,
                    agent_name: resolve_env(service.agent_name)?,
                    target: resolve_env(service.target)?,
                    replace_host: resolve_env(service.replace_host)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let config = ServerConfig {
            name: resolve_env(args.name.or(file.name).unwrap_or(defaults.name))?,
            addr: resolve_env(args.addr.or(file.addr).unwrap_or(defaults.addr))?,
            port: args.port.or(file.port).unwrap_or(defaults.port),
            api_key: resolve_env(args.api_key.or(file.api_key).unwrap_or_default())?,
            proxy_server_host: args
                .proxy_server_host
                .or(file.proxy_server_host)
                .map(resolve_env)
                .transpose()?
                .filter(|host| !host.is_empty()),
            proxy_services,
            upgrade_executable: args.upgrade_executable,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(host) = &self.proxy_server_host {
            if !host.contains('*') {
                return Err(ConfigError::Invalid {
                    field: "proxy_server_host",
                    reason: format!("'{}' must contain '*'", host),
                });
            }
        }

        if self.api_key.is_empty() {
            warn!("api_key is empty, any client can access agents");
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.addr, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                field: "addr",
                reason: e.to_string(),
            })
    }
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ServerConfigFile, ConfigError> {
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
