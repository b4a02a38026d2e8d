//! fabsync daemon: reconciles one fabric on an interval and on file changes.
//!
//! Usage: `fabsyncd [config.json]`. Without an argument the path is taken
//! from `FABSYNC_CONFIG`, then `./fabsync.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use tokio::sync::broadcast;

use fabsync::config::{load_config, Config};
use fabsync::db::Database;
use fabsync::error::{ConfigError, FabsyncError};
use fabsync::gitops::{
    BackgroundWatcher, CyclePhase, InMemoryCluster, LocalFileTree, ProgressBroadcaster,
    SourceWatcher, SyncOrchestrator, SyncScheduler,
};
use fabsync::logging;

const CONFIG_ENV: &str = "FABSYNC_CONFIG";
const DEFAULT_CONFIG: &str = "fabsync.json";

fn main() {
    if let Err(e) = run() {
        eprintln!("fabsyncd: {}", e);
        std::process::exit(1);
    }
}

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn run() -> Result<(), FabsyncError> {
    let config = load_config(config_path())?;
    logging::init(&config.log)?;

    info!(
        "Starting fabsyncd v{} for fabric {}",
        env!("CARGO_PKG_VERSION"),
        config.fabric_id
    );

    let db_path = config.database_path().ok_or_else(|| ConfigError::Validation {
        message: "cannot determine database path; set database_path".to_string(),
    })?;
    let db = Database::open(&db_path)?;

    let root = PathBuf::from(&config.source_directory);
    let orchestrator = Arc::new(build_orchestrator(&config, &root, db));
    log_progress(orchestrator.progress());

    let (trigger_tx, trigger_rx) = broadcast::channel(16);
    let scheduler = SyncScheduler::new(Arc::clone(&orchestrator), config.sync_interval());
    let handle = scheduler.start(trigger_rx);
    // First cycle right away instead of after one interval.
    let _ = trigger_tx.send(());

    let mut watcher = BackgroundWatcher::start(SourceWatcher::new(
        &root,
        &config.raw_directory,
        trigger_tx.clone(),
    ));

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .map_err(|e| FabsyncError::Runtime(format!("failed to install signal handler: {}", e)))?;

    let _ = stop_rx.recv();
    info!("Shutting down");

    watcher.stop();
    scheduler.stop();
    // Wake the scheduler so it sees the shutdown.
    let _ = trigger_tx.send(());
    handle
        .join()
        .map_err(|_| FabsyncError::Runtime("scheduler thread panicked".to_string()))?;

    info!("fabsyncd stopped");
    Ok(())
}

fn build_orchestrator(config: &Config, root: &Path, db: Database) -> SyncOrchestrator {
    // TODO: replace with a Kubernetes API client once cluster credentials are configurable.
    log::warn!("No cluster client configured; using an in-memory cluster");
    SyncOrchestrator::new(
        db,
        Arc::new(LocalFileTree::new(root)),
        Arc::new(InMemoryCluster::new()),
        config,
        ProgressBroadcaster::default(),
    )
}

/// Mirrors terminal cycle events into the log.
fn log_progress(progress: &ProgressBroadcaster) {
    let mut rx = progress.subscribe();
    std::thread::spawn(move || loop {
        match rx.blocking_recv() {
            Ok(event) if event.phase == CyclePhase::Failed => {
                log::error!(
                    "Cycle {} failed: {}",
                    event.cycle_id,
                    event.error.unwrap_or_default()
                );
            }
            Ok(event) if event.phase.is_terminal() => {
                log::debug!("Cycle {} {}: {}", event.cycle_id, event.phase, event.message);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("Progress listener skipped {} event(s)", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    });
}
