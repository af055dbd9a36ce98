//! # Warden Reference Worker
//!
//! Minimal worker process: connects to the supervisor, logs the events it
//! receives, and exits cleanly on `Shutdown` or SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Under a supervisor (runtime dir from WARDEN_RUNTIME_DIR)
//! warden_worker
//!
//! # Without a supervisor
//! warden_worker --standalone -v
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;
use warden_agent::{Agent, AgentConfig};
use warden_common::consts::{DEFAULT_RUNTIME_DIR, RUNTIME_DIR_ENV};
use warden_common::message::{payload_text, Event, Signal};

/// Warden worker - reference worker process
#[derive(Parser, Debug)]
#[command(name = "warden_worker")]
#[command(version)]
#[command(about = "Reference worker process for the warden supervisor")]
#[command(long_about = None)]
struct Args {
    /// Directory holding the supervisor socket
    #[arg(long, env = RUNTIME_DIR_ENV, default_value = DEFAULT_RUNTIME_DIR)]
    runtime_dir: PathBuf,

    /// Run without connecting to a supervisor
    #[arg(long)]
    standalone: bool,

    /// Exit with this status right after the handshake
    #[arg(long, value_name = "CODE")]
    exit_with: Option<i32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("warden_worker failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    info!("warden_worker v{} starting", env!("CARGO_PKG_VERSION"));

    let running = Arc::new(AtomicBool::new(true));
    let lost = Arc::new(AtomicBool::new(false));
    {
        let r = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            r.store(false, Ordering::SeqCst);
        })?;
    }

    let config = if args.standalone {
        AgentConfig::standalone()
    } else {
        AgentConfig::new(args.runtime_dir.clone())
    };
    let agent = Agent::new(config);
    register_callbacks(&agent, &running);
    {
        let r = Arc::clone(&running);
        let l = Arc::clone(&lost);
        agent.set_fatal_handler(move |e| {
            error!("supervisor connection failed: {e}");
            l.store(true, Ordering::SeqCst);
            r.store(false, Ordering::SeqCst);
        });
    }

    agent.start()?;
    if let Some(code) = args.exit_with {
        warn!(code, "exiting on request");
        return Ok(code);
    }
    agent.signal(Signal::ProcessBorn, b"warden_worker ready".to_vec());

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
    }

    agent.stop();
    if lost.load(Ordering::SeqCst) {
        return Ok(1);
    }
    info!("warden_worker shutdown complete");
    Ok(0)
}

fn register_callbacks(agent: &Agent, running: &Arc<AtomicBool>) {
    let r = Arc::clone(running);
    agent.register_callback(Event::Shutdown, move |_| {
        info!("shutdown requested by supervisor");
        r.store(false, Ordering::SeqCst);
    });
    agent.register_callback(Event::RollLogFiles, |_| info!("rolling log files"));
    agent.register_callback(Event::ClearStats, |_| info!("statistics cleared"));
    agent.register_callback(Event::ConfigFileUpdate, |payload| {
        info!(key = %payload_text(payload), "configuration changed");
    });
    agent.register_callback(Event::PluginConfigUpdate, |payload| {
        info!(plugin = %payload_text(payload), "plugin configuration changed");
    });
    for event in [Event::HostStatusUp, Event::HostStatusDown, Event::Drain] {
        agent.register_callback(event, move |payload| {
            info!(?event, detail = %payload_text(payload), "event received");
        });
    }
}

/// Setup tracing subscriber based on CLI arguments
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
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
