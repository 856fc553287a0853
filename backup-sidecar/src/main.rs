//! Backup Sidecar - Main entry point
//!
//! Runs alongside a workload and ships archives of its directories to blob
//! storage until the process is terminated.

use anyhow::Result;
use backup_sidecar::archive::TarArchiver;
use backup_sidecar::daemon::shutdown::ShutdownCoordinator;
use backup_sidecar::scheduler::{ScheduleState, Scheduler};
use backup_sidecar::transfer::BlobUploader;
use backup_sidecar::{utils, BackupRunner, SidecarConfig};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// How long a run in progress may keep going after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(25);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env once, ahead of LOG_LEVEL and the rest of the configuration
    let _ = dotenvy::dotenv();

    // Initialize logging before config so fallback warnings are visible
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    utils::logger::init(&log_level)?;

    let config = SidecarConfig::from_env();

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::info!(
        "Starting backup-sidecar v{} on {}",
        env!("CARGO_PKG_VERSION"),
        host
    );
    tracing::info!(
        config = %config.config_path.display(),
        account = %config.storage.account_name,
        container = %config.storage.container,
        scratch_dir = %config.scratch_dir.display(),
        immediate = config.immediate,
        "Configuration loaded"
    );

    let uploader = BlobUploader::from_settings(&config.storage)?;
    let runner = BackupRunner::new(
        config.config_path.clone(),
        config.storage.clone(),
        config.scratch_dir.clone(),
        Arc::new(TarArchiver::new()),
        Arc::new(uploader),
    );

    let state = ScheduleState::new(config.schedule.clone(), Utc::now(), config.immediate);
    let scheduler = Scheduler::new(state, runner);

    let shutdown_coordinator = ShutdownCoordinator::new();
    let token = shutdown_coordinator.token();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(token).await });

    shutdown_coordinator.wait_for_signal().await;

    match tokio::time::timeout(SHUTDOWN_GRACE, scheduler_handle).await {
        Ok(Ok(())) => tracing::info!("Shutdown complete"),
        Ok(Err(e)) => tracing::error!("Scheduler task panicked: {}", e),
        Err(_) => tracing::warn!(
            "Backup still running after {}s, exiting anyway",
            SHUTDOWN_GRACE.as_secs()
        ),
    }

    Ok(())
}
