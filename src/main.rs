//! # Enactor - process entry point
//!
//! ## Startup Sequence
//!
//! 1. **Configuration** - file, then `ENACTOR_*` environment, then CLI flags
//! 2. **Seed** - optional JSON array of records written to the store
//! 3. **Backend** - subscribe to the bus, load deleters, spawn the observer,
//!    the policy runner and the event listener
//!
//! Any failure during startup halts the process with a clear error message.
//!
//! ## Shutdown
//!
//! Ctrl+C signals every loop to stop; shutdown waits up to 30s for them.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use enactor::cli::{Cli, Commands};
use enactor::{load_seed, seed_store, Backend, EnactorConfig};
use enactor_core::ResultExt;
use enactor_events::{DeleterRegistry, IdentitySource, InMemoryEventBus};
use enactor_reconciler::{builtin_catalog, BackendDriver, InMemoryBackend, InMemoryRecordStore};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EnactorConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    init_tracing(&config.log_level);

    match cli.command {
        Commands::Run {
            seed,
            no_policies,
            deleters_dir,
        } => {
            if no_policies {
                config.policy.enabled = false;
            }
            if deleters_dir.is_some() {
                config.deleters.dir = deleters_dir;
            }
            run(config, seed.as_deref()).await
        }
        Commands::Identity => {
            let source = IdentitySource::new(config.bus.identity_path.clone())
                .with_configured(config.client_id());
            println!("{}", source.identity().await);
            Ok(())
        }
        Commands::Deleters { dir } => {
            let dir = dir
                .or(config.deleters.dir)
                .context("No deleter directory given; pass --dir or set deleters.dir")?;
            let driver: Arc<dyn BackendDriver> = Arc::new(InMemoryBackend::new());
            let registry = DeleterRegistry::load_handlers(&dir, &builtin_catalog(&driver))
                .with_context(|| format!("Failed to load deleters from {}", dir.display()))?;

            for (kind, handlers) in registry.entries() {
                println!("{kind}: {}", handlers.join(", "));
            }
            for error in registry.load_errors() {
                eprintln!("skipped: {error}");
            }
            Ok(())
        }
    }
}

async fn run(config: EnactorConfig, seed: Option<&std::path::Path>) -> Result<()> {
    let start_time = Instant::now();
    info!("Enactor starting...");

    let store = InMemoryRecordStore::new_arc();
    if let Some(path) = seed {
        let records = load_seed(path).context("Failed to read seed records")?;
        let count = seed_store(store.as_ref(), records)
            .await
            .context("Failed to seed record store")?;
        info!(count, path = %path.display(), "Seeded record store");
    }

    let bus = Arc::new(InMemoryEventBus::with_channel_capacity(
        config.bus.channel_capacity,
    ));
    let driver = Arc::new(InMemoryBackend::new());

    let running = Backend::new(config, store, driver, bus)
        .start()
        .await
        .context("Backend startup failed")?;

    info!(
        startup_ms = start_time.elapsed().as_millis(),
        "Enactor running, press Ctrl+C to stop"
    );

    wait_for_shutdown().await;
    running.shutdown().await;

    info!("Enactor shutdown complete");
    Ok(())
}

/// Initialize tracing; `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_shutdown() {
    if signal::ctrl_c()
        .await
        .into_option_logged("Failed to listen for shutdown signal")
        .is_some()
    {
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
