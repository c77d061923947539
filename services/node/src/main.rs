//! Hive node binary
//!
//! Usage:
//!   hived --config config/node.toml
//!   hived --log-level debug

mod services;

use actors::Runtime;
use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hived")]
#[command(about = "Hive service runtime node")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

/// Set from the SIGHUP handler, drained by the watcher thread
static SIGHUP_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sighup(_: nix::libc::c_int) {
    SIGHUP_PENDING.store(true, Ordering::Relaxed);
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    if let Err(e) = run(&args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    info!("Starting Hive node");

    let config = node_config::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    info!(
        "Harbor {} with {} workers, bootstrap {:?}",
        config.harbor, config.thread, config.bootstrap
    );

    let rt = services::register(Runtime::builder(config)).build()?;
    install_sighup(&rt)?;

    rt.start()?;
    info!("All services exited, shutting down");
    Ok(())
}

fn init_logging(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .init();
    }
}

/// Route SIGHUP to a logger reopen
fn install_sighup(rt: &Arc<Runtime>) -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sighup),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to a static atomic
    unsafe { sigaction(Signal::SIGHUP, &action) }.context("Failed to install SIGHUP handler")?;

    let weak: Weak<Runtime> = Arc::downgrade(rt);
    let watcher = thread::Builder::new()
        .name("hive-sighup".to_string())
        .spawn(move || loop {
            thread::sleep(Duration::from_millis(100));
            let Some(rt) = weak.upgrade() else { break };
            if SIGHUP_PENDING.swap(false, Ordering::Relaxed) {
                info!("SIGHUP received, reopening log");
                rt.request_log_reopen();
            }
        });
    if let Err(e) = watcher {
        warn!("Log reopen on SIGHUP disabled: {}", e);
    }
    Ok(())
}
