//! authkeeperd — per-user password authority daemon.
//!
//! Binds the four endpoint sockets, serves requests until SIGTERM/SIGINT,
//! then removes the sockets and the PID file. The daemon runs in the
//! foreground; process supervision (systemd or similar) owns
//! daemonization.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use authkeeper_daemon::{DaemonConfig, Server};

/// Per-user password authority daemon.
#[derive(Parser, Debug)]
#[command(name = "authkeeperd", version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/authkeeper/authkeeper.toml")]
    config: PathBuf,

    /// Directory for the endpoint sockets (overrides the config file).
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Directory for per-user state (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to the PID file (overrides the config file).
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Log filter, e.g. `info` or `authkeeper_core=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = if args.config.exists() {
        DaemonConfig::from_file(&args.config)?
    } else {
        DaemonConfig::default()
    };
    if let Some(runtime_dir) = &args.runtime_dir {
        config.runtime_dir.clone_from(runtime_dir);
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir.clone_from(data_dir);
    }
    if let Some(pid_file) = &args.pid_file {
        config.pid_file = Some(pid_file.clone());
    }
    Ok(config)
}

fn write_pid_file(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write PID file {}", path.display()))?;
    info!(path = %path.display(), "PID file written");
    Ok(())
}

fn remove_pid_file(path: &PathBuf) {
    if let Err(err) = std::fs::remove_file(path) {
        warn!(path = %path.display(), %err, "failed to remove PID file");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).context("invalid --log-level filter")?,
        )
        .init();

    let config = load_config(&args)?;
    info!(
        runtime_dir = %config.runtime_dir.display(),
        data_dir = %config.data_dir.display(),
        "starting authkeeperd"
    );

    if let Some(pid_file) = &config.pid_file {
        write_pid_file(pid_file)?;
    }

    let server = Server::bind(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(%err, "failed to install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = sigint.recv() => info!("SIGINT received"),
        }
        let _ = shutdown_tx.send(true);
    });

    let result = server.run(shutdown_rx).await;

    if let Some(pid_file) = &config.pid_file {
        remove_pid_file(pid_file);
    }
    info!("authkeeperd stopped");
    result
}
