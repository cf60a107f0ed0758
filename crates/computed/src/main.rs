//! computed — the compute control plane daemon.
//!
//! Single binary that assembles the control plane:
//! - Resource store (redb)
//! - Quota evaluator
//! - Resource services and watch engine
//! - Tombstone purge and deactivated-account sweepers
//! - REST API
//!
//! # Usage
//!
//! ```text
//! computed serve --port 8080 --data-dir /var/lib/compute --config /etc/compute/compute.toml
//! computed print-config
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use compute_core::ControlPlaneConfig;
use compute_quota::{QuotaEvaluator, QuotaSource};
use compute_service::{ComputeServices, ServiceContext};
use compute_state::StateStore;
use compute_sweeper::{DeactivationSweeper, FileDeactivationFeed, PurgeSweeper};

const DEFAULT_LOG_FILTER: &str = "info,computed=debug,compute=debug";

#[derive(Parser)]
#[command(name = "computed", about = "Compute control plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server and background sweepers.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/compute")]
        data_dir: PathBuf,

        /// Control plane configuration (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON file listing deactivated accounts. Disables the
        /// deactivation sweeper when omitted.
        #[arg(long)]
        deactivation_feed: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    PrintConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            port,
            data_dir,
            config,
            deactivation_feed,
        } => {
            let config = load_config(config.as_deref())?;
            serve(port, data_dir, config, deactivation_feed).await
        }
        Command::PrintConfig { config } => {
            print!("{}", load_config(config.as_deref())?.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ControlPlaneConfig> {
    match path {
        Some(path) => ControlPlaneConfig::from_file(path)
            .map_err(|e| e.context(format!("loading {}", path.display()))),
        None => Ok(ControlPlaneConfig::default()),
    }
}

async fn serve(
    port: u16,
    data_dir: PathBuf,
    config: ControlPlaneConfig,
    deactivation_feed: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!(region = %config.region, "compute control plane starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("compute.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "resource store opened");

    let quota = QuotaEvaluator::new(QuotaSource::from_config(&config.quota));
    let purge_config = config.purge.clone();
    let services = ComputeServices::new(ServiceContext::new(store.clone(), quota, config));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let deactivation_interval = purge_config.deactivation_interval();
    let purge = PurgeSweeper::new(store, purge_config);
    let purge_shutdown = shutdown_rx.clone();
    let purge_handle = tokio::spawn(async move {
        purge.run(purge_shutdown).await;
    });

    let deactivation_handle = match deactivation_feed {
        Some(path) => {
            info!(path = ?path, "deactivation feed configured");
            let sweeper = DeactivationSweeper::new(
                services.instances.clone(),
                Arc::new(FileDeactivationFeed::new(path)),
                deactivation_interval,
            );
            let shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                sweeper.run(shutdown).await;
            }))
        }
        None => None,
    };

    // ── Start API server ───────────────────────────────────────

    let router = compute_api::build_router(services);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = purge_handle.await;
    if let Some(handle) = deactivation_handle {
        let _ = handle.await;
    }

    info!("compute control plane stopped");
    Ok(())
}
