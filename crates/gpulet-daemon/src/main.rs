//! gpulet daemon
//!
//! Runs one scheduling loop per registered machine until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use gpulet_core::{LoggingConfig, MachineSpec, RunnerConfig};
use gpulet_runtime::DefaultConnector;
use gpulet_scheduler::{MachineScheduler, SharedServices};
use gpulet_store::{FileJobQueue, FileRegistry, LockCoordinator, MachineRegistry, MemoryRegistry};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Id of the machine scheduled when no registry is given
const LOCAL_MACHINE: &str = "local";

/// gpuletd - dispatches queued GPU jobs onto machines with free capacity
#[derive(Parser, Debug)]
#[command(name = "gpuletd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Machine registry file (TOML); without it only this host is scheduled
    #[arg(long)]
    machines: Option<PathBuf>,

    /// Job queue for this host; registry entries carry their own
    #[arg(short = 'f', long, conflicts_with = "machines")]
    job_file: Option<PathBuf>,

    /// Device indices on this host to leave alone, e.g. `0,3`
    #[arg(long, value_delimiter = ',', conflicts_with = "machines")]
    skip_gpus: Vec<u32>,

    /// Status queries folded into one estimate
    #[arg(short, long)]
    n_passes: Option<u32>,

    /// Seconds to sleep between ticks
    #[arg(long)]
    sleep_time: Option<f64>,

    /// Seconds a dispatched job may stay invisible before its reservation lapses
    #[arg(long)]
    keep_time: Option<f64>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RunnerConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RunnerConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    init_logging(&config.logging, args.verbose);
    info!("Starting gpulet daemon v{}", env!("CARGO_PKG_VERSION"));

    let registry: Arc<dyn MachineRegistry> = match &args.machines {
        Some(path) => Arc::new(FileRegistry::new(path)),
        None => Arc::new(MemoryRegistry::new(vec![local_machine(&args)])),
    };
    let services = SharedServices {
        connector: Arc::new(DefaultConnector::new(config.session.clone())),
        registry: registry.clone(),
        locks: Arc::new(LockCoordinator::filesystem(config.lock.poll_interval())),
    };

    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;

    // Fail fast on an unreadable registry; later read errors only skip a scan.
    let machines = registry.list().await?;
    info!(machines = machines.len(), "Machine registry loaded");

    let mut loops = JoinSet::new();
    let mut running = HashSet::new();
    let mut pending = Some(machines);

    loop {
        let machines = match pending.take() {
            Some(machines) => machines,
            None => match registry.list().await {
                Ok(machines) => machines,
                Err(e) => {
                    warn!(error = %e, "Failed to re-read machine registry");
                    Vec::new()
                }
            },
        };

        for machine in machines {
            if !running.insert(machine.id.clone()) {
                continue;
            }
            let queue = FileJobQueue::new(machine.job_file_in(&config.queue.dir));
            info!(
                machine = %machine.id,
                queue = %queue.path().display(),
                enabled = machine.enabled,
                "Starting scheduling loop"
            );
            let scheduler = MachineScheduler::new(
                machine.id,
                Arc::new(queue),
                services.clone(),
                config.scheduler.clone(),
                config.sampler.clone(),
            );
            loops.spawn(scheduler.run(shutdown.clone()));
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.scheduler.poll_interval()) => {}
        }
    }

    while let Some(result) = loops.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Scheduling loop panicked");
        }
    }
    services.locks.release_all().await;

    info!("gpulet daemon stopped");
    Ok(())
}

/// Fold command-line flags over the file configuration
fn apply_overrides(config: &mut RunnerConfig, args: &Args) {
    if let Some(n) = args.n_passes {
        config.scheduler.n_passes = n;
    }
    if let Some(secs) = args.sleep_time {
        config.scheduler.poll_interval_secs = secs;
    }
    if let Some(secs) = args.keep_time {
        config.scheduler.keep_time_secs = secs;
    }
}

/// This host, configured from the command line
fn local_machine(args: &Args) -> MachineSpec {
    let mut machine = MachineSpec::local(LOCAL_MACHINE);
    machine.skip_gpus = args.skip_gpus.clone();
    machine.job_file = args.job_file.clone();
    machine
}

fn init_logging(logging: &LoggingConfig, verbose: u8) {
    let level = match verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if logging.format == "compact" {
        builder.compact().try_init()
    } else {
        builder.try_init()
    };
}

/// Cancel the returned token on SIGTERM or SIGINT
fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        trigger.cancel();
    });

    Ok(token)
}
