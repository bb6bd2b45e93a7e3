//! rigkeeper - remote launcher for amateur-radio modem software
//!
//! Listens on a TCP port for clients that start, stop and monitor the modems
//! described in a JSON configuration file, and announces every modem through
//! service discovery.
//!
//! # Usage
//!
//! ```bash
//! # Configuration next to the executable (rigkeeper.json)
//! rigkeeper
//!
//! # Explicit configuration, no startup delay
//! rigkeeper --config /etc/rigkeeper.json --no-delay
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rigkeeper_core::{default_config_path, ModemRegistry, ServiceConfig};
use rigkeeperd::discovery::{records_for, LogAdvertiser, ServiceAdvertiser};
use rigkeeperd::server::{ControlServer, ServiceContext, SessionSettings};

/// rigkeeper - network-controlled modem launcher and audio level monitor
#[derive(Parser, Debug)]
#[command(name = "rigkeeper", version, about)]
struct Args {
    /// Configuration file [default: executable path with a .json extension]
    #[arg(short, long, env = "RIGKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Skip the startup delay
    #[arg(long)]
    no_delay: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("rigkeeper=info".parse()?)
                .add_directive("rigkeeperd=info".parse()?)
                .add_directive("rigkeeper_core=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "rigkeeper starting"
    );

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path().context("Failed to determine default config path")?,
    };
    let config = ServiceConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    config.validate().context("Invalid configuration")?;

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    // Give a hotspot or DHCP network time to come up
    if !args.no_delay {
        let delay = Duration::from_secs(config.delay_secs());
        info!(secs = delay.as_secs(), "Delaying startup");
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Shutdown during startup delay");
                return Ok(());
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let settings = SessionSettings {
        match_threshold: config.match_threshold(),
        ..SessionSettings::default()
    };
    let registry = Arc::new(ModemRegistry::new(config.modems.clone()));
    let context = Arc::new(ServiceContext::new(Arc::clone(&registry), &config_path).with_settings(settings));

    let server = ControlServer::bind(config.port, context, cancel_token)
        .await
        .context("Failed to start control server")?;

    let mut advertiser = LogAdvertiser::new();
    advertiser
        .advertise(&records_for(&registry, config.port))
        .context("Failed to advertise services")?;

    let result = server.run().await;
    advertiser.shutdown();

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("rigkeeper stopped");
    Ok(())
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
