//! wsrelay daemon - AMQP queue to WebSocket live-tail relay
//!
//! Consumes a durable queue and pushes every message to all connected
//! WebSocket subscribers, in arrival order. Messages are not stored:
//! a subscriber only sees what arrives while it is connected.
//!
//! # Usage
//!
//! ```bash
//! # Run with ./wsrelay.toml if present, defaults otherwise
//! relayd
//!
//! # Run with an explicit config file
//! relayd --config /etc/wsrelay.toml run
//!
//! # Print the resolved configuration and exit
//! relayd check-config
//!
//! # Override single settings
//! WSRELAY_PORT=9000 WSRELAY_QUEUE=ticks relayd
//!
//! # Enable debug logging
//! RUST_LOG=wsrelayd=debug relayd
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown
//!
//! The process exits non-zero when the broker connection cannot be
//! established or the queue consumer stops delivering.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wsrelay_core::{EventKind, EventStatus, RelayConfig};
use wsrelayd::logging;
use wsrelayd::source::amqp::redact_url;
use wsrelayd::{AmqpSource, Broadcaster, IngestLoop, RelayServer, ServerSettings, SubscriberRegistry};

/// Config file read when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "wsrelay.toml";

/// wsrelay daemon - live-tail a queue over WebSocket
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (default)
    Run,
    /// Print the resolved configuration and exit
    CheckConfig,
}

/// Resolves configuration: file (or defaults), then environment, then
/// validation. An explicitly named file must exist.
fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    let mut config = match path {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::load_or_default(Path::new(DEFAULT_CONFIG_PATH))?,
    };
    config
        .apply_env()
        .context("Invalid environment override")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_relay(config),
        Command::CheckConfig => {
            let mut shown = config;
            shown.broker.url = redact_url(&shown.broker.url);
            let text = serde_json::to_string_pretty(&shown)
                .context("Failed to render configuration")?;
            println!("{text}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_relay(config: RelayConfig) -> Result<()> {
    let _log_guard = logging::init(&config.log).context("Failed to initialize logging")?;

    info!(
        event = %EventKind::ConfigLoad,
        status = %EventStatus::Success,
        queue = %config.broker.queue,
        port = config.server.port,
        path = %config.server.path,
        "Configuration loaded"
    );
    info!(
        event = %EventKind::ServiceStart,
        status = %EventStatus::Initializing,
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "wsrelay starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = SubscriberRegistry::new();
    let settings = ServerSettings::from_config(&config.server)?;
    let server = RelayServer::bind(settings, registry.clone(), cancel_token.clone())
        .await
        .context("Failed to start WebSocket server")?;

    let source = AmqpSource::connect(&config.broker)
        .await
        .context("Failed to start queue consumer")?;

    let server_handle = tokio::spawn(server.run());
    info!(
        event = %EventKind::ServiceStart,
        status = %EventStatus::Started,
        "wsrelay running"
    );

    let broadcaster = Broadcaster::new(registry, config.server.write_timeout());
    let mut ingest = IngestLoop::new(source, broadcaster, cancel_token.clone());
    let outcome = ingest.run().await;

    // Stop accepting and close remaining subscribers in every case.
    cancel_token.cancel();
    ingest.into_source().close().await;
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Server stopped with error"),
        Err(e) => warn!(error = %e, "Server task failed"),
    }

    match outcome {
        Ok(relayed) => {
            info!(
                event = %EventKind::ServiceStop,
                status = %EventStatus::Stopped,
                relayed,
                "wsrelay stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(
                event = %EventKind::ServiceStop,
                status = %EventStatus::Failed,
                error = %e,
                "wsrelay stopping after ingestion failure"
            );
            Err(e.into())
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
