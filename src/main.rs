//! Outpost CLI - agent and server in one executable
//!
//! Shipping one binary lets the server hand its own executable to agents it
//! upgrades.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use outpost_agent::{Agent, AgentArgs, AgentConfig};
use outpost_server::{Server, ServerArgs, ServerConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Outpost - reach machines behind NAT through connections they open
#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Outpost - reach machines behind NAT through connections they open")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an agent that serves sessions requested through a server
    #[command(long_about = r#"
Connect to an outpost server and serve the shell, terminal, file transfer
and proxy sessions requested through it. Reconnects with backoff when the
server is unreachable.

EXAMPLES:
  outpost agent --name edge-1 --base-url https://outpost.example.com
  outpost agent --config agent.yaml

ENVIRONMENT VARIABLES:
  OUTPOST_AGENT_NAME   Agent name
  OUTPOST_BASE_URL     Server base URL
    "#)]
    Agent {
        #[command(flatten)]
        args: AgentArgs,
    },

    /// Run the server agents connect to
    #[command(long_about = r#"
Accept agent connections and serve the client, upgrade and proxy APIs.

EXAMPLES:
  outpost server --port 8080 --api-key $API_KEY
  outpost server --config server.yaml

ENVIRONMENT VARIABLES:
  OUTPOST_SERVER_NAME         Server name
  OUTPOST_ADDR                Bind address
  OUTPOST_PORT                Bind port
  OUTPOST_API_KEY             API key for client and proxy endpoints
  OUTPOST_PROXY_SERVER_HOST   Proxy host template (must contain '*')
  OUTPOST_UPGRADE_EXECUTABLE  Executable sent to upgrading agents
    "#)]
    Server {
        #[command(flatten)]
        args: ServerArgs,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Agent { args } => run_agent(args).await,
        Commands::Server { args } => run_server(args).await,
    }
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let config = AgentConfig::from_args(args).context("Failed to build agent configuration")?;
    info!("Agent name: {}", config.name);
    info!("Server: {}", config.base_url);

    let agent = Agent::new(config).context("Failed to create agent")?;
    let stop = agent.stop_token();

    let run = agent.run();
    tokio::pin!(run);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            stop.cancel();
            run.await;
        }
        _ = &mut run => {}
    }

    info!("Agent stopped");
    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = ServerConfig::from_args(args).context("Failed to build server configuration")?;
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
