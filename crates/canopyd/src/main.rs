//! canopyd — the Canopy daemon.
//!
//! Single binary that assembles the rollout engine:
//! - State store (redb)
//! - Evaluator registry (validated at startup)
//! - Rollout driver sweep loop
//!
//! # Usage
//!
//! ```text
//! canopyd run --config /etc/canopy/canopy.toml --data-dir /var/lib/canopy
//! canopyd check-config --config /etc/canopy/canopy.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use canopy_core::EngineConfig;
use canopy_rollout::{EvaluatorRegistry, RolloutDriver, RolloutManager, StoreBackend};
use canopy_state::StateStore;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canopyd", about = "Canopy rollout daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rollout driver until Ctrl-C.
    Run {
        /// Path to canopy.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Seconds between driver sweeps.
        #[arg(long)]
        sweep_interval: Option<u64>,
    },
    /// Parse a config file, validate the evaluator registry, print the result.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => Ok(EngineConfig::default()),
    }
}

/// CLI flags take precedence over the file.
fn apply_overrides(
    mut config: EngineConfig,
    data_dir: Option<PathBuf>,
    sweep_interval: Option<u64>,
) -> anyhow::Result<EngineConfig> {
    if let Some(dir) = data_dir {
        config.store.data_dir = dir;
    }
    if let Some(secs) = sweep_interval {
        config.driver.sweep_interval_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &EngineConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.log_filter())?,
    };
    if config.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Wire store, registry, manager and driver together.
fn build_driver(store: StateStore, config: &EngineConfig) -> anyhow::Result<Arc<RolloutDriver>> {
    let backend = Arc::new(StoreBackend::new(store, config.driver.action_batch_size));
    let registry = EvaluatorRegistry::with_defaults(backend.clone())?;
    let manager = Arc::new(
        RolloutManager::new(backend, Arc::new(registry))
            .with_approval(config.rollout.require_approval),
    );
    Ok(Arc::new(RolloutDriver::new(manager, config.driver.clone())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            sweep_interval,
        } => {
            let config = apply_overrides(load_config(config.as_deref())?, data_dir, sweep_interval)?;
            init_tracing(&config)?;
            run(config).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    info!("Canopy daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.store.db_path();

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let driver = build_driver(store, &config)?;
    info!(
        interval = config.driver.sweep_interval_secs,
        batch = config.driver.action_batch_size,
        "rollout driver initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver_handle = tokio::spawn(driver.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Let an in-flight sweep finish.
    if !await_driver(driver_handle).await {
        anyhow::bail!("rollout driver stopped abnormally");
    }

    info!("Canopy daemon stopped");
    Ok(())
}

/// Wait for the driver task. Returns false if it panicked or was aborted.
async fn await_driver(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "rollout driver task failed");
            false
        }
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::from_file(path)?;
    // Registry completeness does not depend on stored data.
    build_driver(StateStore::open_in_memory()?, &config)?;
    println!("{}", config.to_toml_string()?);
    Ok(())
}
