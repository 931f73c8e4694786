//! sagent - the Sashimono contract-instance agent daemon.
//!
//! Startup order: parse args, initialize logging, load configuration,
//! probe host readiness, open the catalog, wire the lifecycle controller,
//! bind the admin socket, then serve until SIGTERM/SIGINT. Teardown drains
//! the in-flight session and removes the socket file.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use sagent_core::AgentConfig;
use sagent_daemon::catalog::Catalog;
use sagent_daemon::host::engine::DockerCli;
use sagent_daemon::host::hpfs::SystemdHpfs;
use sagent_daemon::host::readiness::ReadinessProbe;
use sagent_daemon::host::users::ScriptUserSetup;
use sagent_daemon::{Agent, AdminServer};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Sashimono agent - contract instance manager
#[derive(Parser, Debug)]
#[command(name = "sagent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the agent configuration file
    #[arg(short, long, default_value = "/etc/sashimono/sa.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Skip the host readiness probe (development hosts only)
    #[arg(long)]
    skip_readiness: bool,
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // One worker owns the accept loop, dispatch, catalog and host
    // orchestration; requests are strictly serial.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    init_tracing(&args)?;

    let config = if args.config.exists() {
        AgentConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!(path = %args.config.display(), "no config file found, using defaults");
        AgentConfig::default()
    };

    if args.skip_readiness {
        info!("host readiness probe skipped");
    } else {
        ReadinessProbe::default()
            .check()
            .await
            .context("host is not ready")?;
    }

    let catalog =
        Catalog::open(config.catalog_db_path()).context("failed to open instance catalog")?;

    let engine = Box::new(DockerCli::new(&config.paths.docker_bin));
    let users = Box::new(ScriptUserSetup::new(
        &config.paths.user_install_script,
        &config.paths.user_uninstall_script,
    ));
    let hpfs = Box::new(SystemdHpfs);

    let socket_path = config.socket_path();
    let mut agent = Agent::new(config, catalog, engine, users, hpfs)
        .map_err(|err| anyhow::anyhow!("agent init failed: {err}"))?;

    let server = AdminServer::bind(&socket_path).context("failed to bind admin socket")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(error = %err, "failed to register SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(error = %err, "failed to register SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_flag.store(true, Ordering::SeqCst);
    });

    info!(
        pid = std::process::id(),
        socket = %socket_path.display(),
        "sagent started"
    );

    server.run(&mut agent, &shutdown).await;

    server.cleanup();
    info!("sagent shutdown complete");
    Ok(())
}
