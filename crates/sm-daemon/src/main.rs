//! shellmux daemon: browser terminals multiplexed over one WebSocket, plus
//! an AI assistant endpoint.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sm_core::config::Config;
use sm_daemon::{Backend, Daemon};
use sm_telemetry::logging::{self, LogFormat};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// shellmux -- web terminal gateway with an AI assistant.
#[derive(Parser)]
#[command(name = "shellmux", version, about)]
struct Cli {
    /// Config file (default: ~/.shellmux/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.host`.
    #[arg(long)]
    host: Option<String>,

    /// Override `server.port`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Use echo shells and canned AI answers instead of SSH and real providers.
    #[arg(long)]
    mock: bool,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let format = if cli.log_json || config.general.log_json {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    logging::init("shellmux", &config.general.log_level, format);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "shellmux starting");

    let backend = if cli.mock { Backend::Mock } else { Backend::Live };
    let daemon = Daemon::new(config, backend).context("failed to build daemon")?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
