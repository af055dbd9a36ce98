//! # Warden Supervisor Binary
//!
//! Launches the caching-proxy worker, keeps it running, relays events to it
//! and raises operator alarms.
//!
//! # Usage
//!
//! ```bash
//! # Default configuration path
//! warden
//!
//! # Explicit config, verbose JSON logs
//! warden --config /etc/warden/warden.toml -v --json
//!
//! # Serve the socket without launching a worker
//! warden --config warden.toml --no-worker
//! ```
//!
//! SIGINT/SIGTERM shut down gracefully; SIGHUP rereads watched
//! configuration files.

use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;
use warden::alarms::AlarmKind;
use warden::{Context, Supervisor};
use warden_common::config::{ConfigError, ConfigLoader, LogLevel, WardenConfig};
use warden_common::consts::DEFAULT_CONFIG_PATH;
use warden_common::message::Event;

/// Warden - caching-proxy control plane supervisor
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Supervises the caching-proxy worker process")]
#[command(long_about = None)]
struct Args {
    /// Path to warden.toml
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Do not launch a worker; only serve the socket
    #[arg(long)]
    no_worker: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("warden startup failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = load_config(&args);
    setup_tracing(
        &args,
        loaded
            .as_ref()
            .map(|c| c.shared.log_level)
            .unwrap_or_default(),
    );
    let mut config = loaded?;
    if args.no_worker {
        config.supervisor.run_worker = false;
    }

    info!(
        "warden v{} starting (service {})",
        env!("CARGO_PKG_VERSION"),
        config.shared.service_name
    );

    let ctx = Context::from_config(&config)?;
    info!("watching {} configuration files", ctx.configs.len());

    let mut supervisor = Supervisor::new(config.supervisor.clone(), ctx)?;
    supervisor.forward_config_changes();

    let stop = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGHUP, Arc::clone(&reload))?;

    while !stop.load(Ordering::SeqCst) {
        supervisor.run_once()?;
        if reload.swap(false, Ordering::SeqCst) {
            reload_configuration(&supervisor);
        }
    }

    info!("Received shutdown signal");
    supervisor.shutdown_worker();
    info!("warden shutdown complete");
    Ok(())
}

/// Load and validate the configuration file.
fn load_config(args: &Args) -> Result<WardenConfig, ConfigError> {
    let config = WardenConfig::load(&args.config)?;
    config.validate()?;
    Ok(config)
}

/// Reread watched files, alarm on failed callbacks, then tell plugins.
fn reload_configuration(supervisor: &Supervisor) {
    info!("SIGHUP: rereading configuration files");
    let report = supervisor.configs().reread_config();
    info!(
        "{} files changed, {} children dropped",
        report.notified.len(),
        report.dropped_children.len()
    );
    for err in &report.errors {
        supervisor
            .alarms()
            .signal(AlarmKind::ConfigUpdateFailed, None, Some(&err.to_string()));
    }
    supervisor
        .handle()
        .send_event(Event::PluginConfigUpdate, b"*".to_vec());
}

/// Setup tracing subscriber based on CLI arguments and the configured level.
fn setup_tracing(args: &Args, configured: LogLevel) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        match configured {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
