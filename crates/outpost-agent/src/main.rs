//! Outpost Agent - serves terminal, file, shell and proxy sessions for a server
//!
//! The agent only dials out: it holds a notify stream open to the server and
//! connects back for every session the server requests.

use anyhow::{Context, Result};
use clap::Parser;
use outpost_agent::{Agent, AgentArgs, AgentConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Outpost agent - lets a server reach this machine without inbound connectivity
#[derive(Parser, Debug)]
#[command(name = "outpost-agent")]
#[command(version)]
#[command(long_about = r#"
Outpost Agent connects to an outpost server and serves the shell, terminal,
file transfer and proxy sessions requested through it.

EXAMPLES:
  # Start agent with basic configuration
  outpost-agent --name edge-1 --base-url https://outpost.example.com

  # Start agent using config file
  outpost-agent --config agent.yaml --log-level debug

ENVIRONMENT VARIABLES:
  OUTPOST_AGENT_NAME   Agent name
  OUTPOST_BASE_URL     Server base URL
"#)]
struct Args {
    #[command(flatten)]
    agent: AgentArgs,

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

    info!("Outpost Agent starting...");

    let config =
        AgentConfig::from_args(args.agent).context("Failed to build agent configuration")?;
    info!("Agent name: {}", config.name);
    info!("Server: {}", config.base_url);

    let agent = Agent::new(config).context("Failed to create agent")?;
    info!("User agent: {}", agent.user_agent());
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
