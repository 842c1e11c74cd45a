//! netwatchdog - Network Health Watchdog
//!
//! Probes targets on a fixed interval and, once a target has failed enough
//! consecutive checks, runs a recovery command on its server over SSH.

mod config;
mod probe;
mod remediate;
mod scheduler;

use config::WatchdogConfig;
use probe::NetProber;
use remediate::SshRemediator;
use scheduler::Supervisor;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(version, about = "Resets remote hosts when their network probes keep failing")]
struct Args {
    /// Path to the YAML probe configuration
    #[arg(short, long, env = "NETWATCHDOG_CONFIG")]
    config: PathBuf,

    /// Log every successful check and per-packet ping details
    #[arg(short, long)]
    verbose: bool,

    /// How long to wait for in-flight checks on shutdown
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(format!("netwatchdog={}", level).parse()?))
        .init();

    // Load configuration; any error here stops the process
    let cfg = WatchdogConfig::from_file(&args.config)?;
    tracing::info!(
        "Loaded {} probes from {}",
        cfg.probes.len(),
        args.config.display()
    );

    let client = reqwest::Client::builder().build()?;
    let prober = Arc::new(NetProber::new(client));
    let remediator = Arc::new(SshRemediator::new());

    let supervisor = Supervisor::start(cfg.probes, prober, remediator, args.verbose);
    tracing::info!("Watching {} targets, press Ctrl-C to stop", supervisor.len());

    wait_for_shutdown().await?;
    tracing::info!("Shutdown requested");

    supervisor.shutdown();
    let unfinished = supervisor.join(args.shutdown_timeout).await;
    if unfinished > 0 {
        tracing::warn!("Exiting with {} monitors still busy", unfinished);
    }

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
