//! CADVAULT - CAD-as-a-Service Resilience Core
//!
//! Worker entry point. Validates configuration, wires the service
//! registry, and runs the worker loop with its background sweeps.
//!
//! Exit codes: 0 success, 1 generic failure, 2 configuration error,
//! 3 validation error, 4 storage unreachable, 5 external-collaborator
//! failure.

use std::process::ExitCode;
use std::time::Duration;

use cadvault::config::EnvironmentConfig;
use cadvault::storage::StorageError;
use cadvault::ServiceRegistry;

const EXIT_GENERIC: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_STORAGE: u8 = 4;

fn main() -> ExitCode {
    // Logging first, so startup failures are visible.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  CADVAULT - CAD-as-a-Service Resilience Core");
    log::info!("  Version: {}", cadvault::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");

    let config = match EnvironmentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = config.validate() {
        log::error!("Startup validation refused: {}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Runtime startup failed: {}", e);
            return ExitCode::from(EXIT_GENERIC);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Worker failed: {}", e);
            match e.downcast_ref::<StorageError>() {
                Some(StorageError::Unreachable(_)) => ExitCode::from(EXIT_STORAGE),
                _ => ExitCode::from(EXIT_GENERIC),
            }
        }
    }
}

async fn run(config: EnvironmentConfig) -> anyhow::Result<()> {
    let worker_id = config.worker_id.clone();
    let registry = ServiceRegistry::bootstrap(config).await?;

    log::info!("Worker {} online", worker_id);
    registry.health.start().await;

    let worker = registry.spawn_worker(&worker_id);

    // Background sweeps: force-cancel, lifecycle, WAL retention.
    let scheduler = registry.scheduler.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            if let Err(e) = scheduler.force_cancel_sweep().await {
                log::error!("Force-cancel sweep failed: {}", e);
            }
        }
    });

    let lifecycle = registry.lifecycle.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            if let Err(e) = lifecycle.apply().await {
                log::error!("Lifecycle sweep failed: {}", e);
            }
        }
    });

    let wal = registry.wal.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
        loop {
            ticker.tick().await;
            if let Err(e) = wal.retention_sweep().await {
                log::error!("WAL retention sweep failed: {}", e);
            }
        }
    });

    // The claim loop.
    loop {
        if !worker.run_once().await {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}
