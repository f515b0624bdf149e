//! Outpost Server - reaches agents behind NAT through their own connections

use anyhow::{Context, Result};
use clap::Parser;
use outpost_server::{Server, ServerArgs, ServerConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Outpost server - runs commands, terminals and proxies through connected agents
#[derive(Parser, Debug)]
#[command(name = "outpost-server")]
#[command(version)]
#[command(long_about = r#"
Outpost Server accepts agent connections and lets API clients run shell
commands and terminals on them, upgrade them, and reach HTTP services on
their networks through proxy hosts.

EXAMPLES:
  # Start server on the default port
  outpost-server --api-key $API_KEY

  # Serve proxy services as <name>.proxy.example.com
  outpost-server --port 9000 --proxy-server-host '*.proxy.example.com'

  # Start server using config file
  outpost-server --config server.yaml --log-level debug

ENVIRONMENT VARIABLES:
  OUTPOST_SERVER_NAME         Server name
  OUTPOST_ADDR                Bind address
  OUTPOST_PORT                Bind port
  OUTPOST_API_KEY             API key for client and proxy endpoints
  OUTPOST_PROXY_SERVER_HOST   Proxy host template (must contain '*')
  OUTPOST_UPGRADE_EXECUTABLE  Executable sent to upgrading agents
"#)]
struct Args {
    #[command(flatten)]
    server: ServerArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    info!("Outpost Server starting...");

    let config =
        ServerConfig::from_args(args.server).context("Failed to build server configuration")?;
    let server = Server::new(config).context("Failed to register proxy services")?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
    });

    server.run().await
}
