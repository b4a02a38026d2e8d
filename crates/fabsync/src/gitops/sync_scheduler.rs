//! Periodic reconciliation scheduler.
//!
//! Runs the orchestrator on a fixed interval and whenever a trigger arrives
//! (a watched file changed, an operator asked for a sync).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use super::reconciler::SyncOrchestrator;

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the sync loop in a background thread.
    /// `trigger_rx` requests an immediate cycle.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start scheduler runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Sync triggered for fabric {}", orchestrator.fabric_id());
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    match orchestrator.run_cycle().await {
                        Ok(report) if report.skipped => {}
                        Ok(report) if !report.errors.is_empty() => {
                            log::warn!(
                                "Sync cycle {} finished with {} error(s)",
                                report.cycle_id,
                                report.errors.len()
                            );
                        }
                        Ok(report) if report.transitions > 0 => {
                            log::info!(
                                "Sync cycle {}: {} transition(s)",
                                report.cycle_id,
                                report.transitions
                            );
                        }
                        Err(e) => log::error!("Sync cycle failed: {}", e),
                        _ => {}
                    }
                }
            });
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
