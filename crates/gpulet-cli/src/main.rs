//! gpulet CLI
//!
//! Operator tooling for job queues, lock markers and device status.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gpulet_core::RunnerConfig;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

/// gpulet - queue GPU jobs and inspect the machines they run on
#[derive(Parser, Debug)]
#[command(name = "gpulet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Machine registry file (TOML)
    #[arg(long, global = true)]
    machines: Option<PathBuf>,

    /// Use this queue file instead of the machine's
    #[arg(short = 'f', long, global = true)]
    job_file: Option<PathBuf>,

    /// Machine to act on
    #[arg(short, long, default_value = "local", global = true)]
    machine: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a job
    Submit {
        /// Free memory the device must have, in MiB
        mem: u64,

        /// Free utilization the device must have (0-100)
        util: u32,

        /// Command to run; `{}` is replaced by the device index
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// List queued jobs
    Jobs,

    /// Remove a queued job
    Remove {
        /// Position as shown by `jobs` (1-based)
        position: usize,
    },

    /// Show free device resources
    Gpus {
        /// Status queries folded into one estimate
        #[arg(short, long)]
        n_passes: Option<u32>,

        /// Show devices that do not report utilization
        #[arg(long)]
        keep_all: bool,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show lock markers on the queue
    Locks,

    /// Remove a stale lock marker
    Unlock {
        /// Holder suffix as shown by `locks`
        suffix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let config = match &cli.config {
        Some(path) => RunnerConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RunnerConfig::default(),
    };
    let ws = commands::Workspace::new(config, cli.machines, cli.job_file);
    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;

    let result = tokio::select! {
        _ = shutdown.cancelled() => Err(anyhow::anyhow!("Interrupted")),
        result = run(&ws, &cli.machine, cli.command) => result,
    };
    // An interrupted command may still hold a queue lock.
    ws.release_all().await;
    result
}

async fn run(ws: &commands::Workspace, machine: &str, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Submit { mem, util, command } => {
            commands::submit(ws, machine, mem, util, command).await?;
        }
        Commands::Jobs => {
            commands::jobs(ws, machine).await?;
        }
        Commands::Remove { position } => {
            commands::remove(ws, machine, position).await?;
        }
        Commands::Gpus {
            n_passes,
            keep_all,
            json,
        } => {
            commands::gpus(ws, machine, n_passes, keep_all, json).await?;
        }
        Commands::Locks => {
            commands::locks(ws, machine).await?;
        }
        Commands::Unlock { suffix } => {
            commands::unlock(ws, machine, &suffix).await?;
        }
    }

    Ok(())
}

/// Cancel the returned token on SIGTERM or SIGINT
fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => debug!("Received SIGTERM"),
            _ = sigint.recv() => debug!("Received SIGINT"),
        }
        trigger.cancel();
    });

    Ok(token)
}
