//! # HV watchdog
//!
//! Independent liveness monitor for the HV supervisor. Echoes the supervisor's
//! heartbeat and raises an alarm when it goes quiet.
//!
//! ```bash
//! hv-watchdog --config /etc/cryo-hv/watchdog.toml
//! hv-watchdog --bind 0.0.0.0:5005 --allow 10.0.0.12 --max-staleness 120
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use cryo_hv::{config::WatchdogConfig, notify::LogNotifier, watchdog::WatchdogServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// HV watchdog - alarms when the HV supervisor stops sending heartbeats
#[derive(Parser, Debug)]
#[command(name = "hv-watchdog")]
#[command(version)]
#[command(about = "Heartbeat echo server and staleness alarm for the HV supervisor")]
struct Args {
    /// Watchdog configuration (TOML). Defaults are used when absent.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration.
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Source address allowed to connect (can be specified multiple times).
    /// Only 127.0.0.1 is allowed when none is given.
    #[arg(long, action = clap::ArgAction::Append)]
    allow: Vec<String>,

    /// Seconds without a heartbeat before the alarm is raised.
    #[arg(long, value_name = "SECONDS")]
    max_staleness: Option<u64>,
}

fn main() {
    if let Err(e) = run() {
        error!("watchdog failed: {e}");
        eprintln!("hv-watchdog: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => WatchdogConfig::load(path)?,
        None => WatchdogConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if !args.allow.is_empty() {
        config.allow = args.allow;
    }
    if let Some(seconds) = args.max_staleness {
        config.max_staleness_s = seconds;
    }
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("hv-watchdog v{} starting", env!("CARGO_PKG_VERSION"));
    let mut server = WatchdogServer::new(config, Arc::new(LogNotifier))?;
    let address = server.start()?;
    info!(%address, "waiting for heartbeats");
    server.wait();
    Ok(())
}
