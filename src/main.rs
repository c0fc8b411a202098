//! hmac-proxy: signing forward proxy and verifying reverse proxy.
//!
//! This is the main entry point for the hmac-proxy binary. It handles CLI
//! argument parsing, logging setup and configuration loading, then hands
//! the configuration to the supervisor and waits for either an interrupt
//! or the first instance failure.

use anyhow::{Context, Result};
use clap::Parser;
use hmac_proxy::{
    cli::Cli,
    config::ConfigLoader,
    supervisor::{StopReport, Supervisor},
};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;
    debug!("Parsed CLI arguments: {:?}", cli);

    let loader = ConfigLoader::new(&cli.config);
    let config = loader
        .load()
        .with_context(|| format!("Failed to load configuration from {:?}", loader.path()))?;
    let stop_timeout = config.supervisor.stop_timeout();

    let (handle, abort) = Supervisor::start(&config);

    let failure = tokio::select! {
        err = abort.fired() => Some(err),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for interrupt")?;
            info!("Interrupt received, shutting down");
            None
        }
    };

    let report = handle.stop(stop_timeout).await;
    log_report(&report);

    if let Some(err) = failure {
        for other in abort.diagnostics().iter().skip(1) {
            error!("Also failed: {}", other);
        }
        anyhow::bail!("{}", err);
    }
    Ok(())
}

fn log_report(report: &StopReport) {
    info!(stopped = ?report.stopped, "Stop complete");
    if !report.forced.is_empty() {
        warn!(forced = ?report.forced, "Instances were force-closed");
    }
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "Instances never started");
    }
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, or warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
