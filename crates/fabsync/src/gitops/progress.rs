//! Reconciliation cycle progress for real-time status streaming.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Phase of a reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Starting,
    RefreshingSource,
    Indexing,
    Ingesting,
    ObservingCluster,
    /// Per-resource units are running.
    Reconciling,
    Alerting,
    Remediating,
    RecomputingFabric,
    Completed,
    Skipped,
    Cancelled,
    Failed,
}

impl CyclePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CyclePhase::Completed | CyclePhase::Skipped | CyclePhase::Cancelled | CyclePhase::Failed
        )
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Starting => write!(f, "Starting..."),
            CyclePhase::RefreshingSource => write!(f, "Refreshing source tree..."),
            CyclePhase::Indexing => write!(f, "Indexing desired records..."),
            CyclePhase::Ingesting => write!(f, "Ingesting raw files..."),
            CyclePhase::ObservingCluster => write!(f, "Observing cluster..."),
            CyclePhase::Reconciling => write!(f, "Reconciling resources..."),
            CyclePhase::Alerting => write!(f, "Evaluating alerts..."),
            CyclePhase::Remediating => write!(f, "Running auto-remediation..."),
            CyclePhase::RecomputingFabric => write!(f, "Recomputing fabric status..."),
            CyclePhase::Completed => write!(f, "Completed"),
            CyclePhase::Skipped => write!(f, "Skipped"),
            CyclePhase::Cancelled => write!(f, "Cancelled"),
            CyclePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// A cycle progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleProgressEvent {
    /// Unique identifier for this cycle.
    pub cycle_id: String,
    pub fabric_id: String,
    pub phase: CyclePhase,
    /// Human-readable status message.
    pub message: String,
    /// Progress percentage (0-100), if determinable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CycleProgressEvent {
    pub fn new(cycle_id: &str, fabric_id: &str, phase: CyclePhase, message: &str) -> Self {
        Self {
            cycle_id: cycle_id.to_string(),
            fabric_id: fabric_id.to_string(),
            phase,
            message: message.to_string(),
            progress: None,
            current: None,
            total: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(cycle_id: &str, fabric_id: &str, message: &str) -> Self {
        Self::new(cycle_id, fabric_id, CyclePhase::Completed, message)
    }

    pub fn failed(cycle_id: &str, fabric_id: &str, error: &str) -> Self {
        let mut event = Self::new(cycle_id, fabric_id, CyclePhase::Failed, "Cycle failed");
        event.error = Some(error.to_string());
        event
    }

    /// Sets progress information.
    pub fn with_progress(mut self, current: u64, total: u64) -> Self {
        self.current = Some(current);
        self.total = Some(total);
        if total > 0 {
            self.progress = Some(((current * 100) / total).min(100) as u8);
        }
        self
    }
}

/// Tracks progress of a single cycle, with cancellation support.
pub struct CycleProgress {
    cycle_id: String,
    fabric_id: String,
    sender: Arc<broadcast::Sender<CycleProgressEvent>>,
    cancelled: Arc<AtomicBool>,
}

impl CycleProgress {
    pub fn new(fabric_id: &str, sender: Arc<broadcast::Sender<CycleProgressEvent>>) -> Self {
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            fabric_id: fabric_id.to_string(),
            sender,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cycle_id(&self) -> &str {
        &self.cycle_id
    }

    /// Broadcasts a phase update.
    pub fn phase(&self, phase: CyclePhase) {
        self.send(CycleProgressEvent::new(
            &self.cycle_id,
            &self.fabric_id,
            phase,
            &phase.to_string(),
        ));
    }

    /// Broadcasts how many per-resource units have finished.
    pub fn units(&self, done: u64, total: u64) {
        let event = CycleProgressEvent::new(
            &self.cycle_id,
            &self.fabric_id,
            CyclePhase::Reconciling,
            &format!("Reconciled {}/{} resources", done, total),
        )
        .with_progress(done, total);
        self.send(event);
    }

    pub fn finished(&self, phase: CyclePhase, message: &str) {
        self.send(CycleProgressEvent::new(&self.cycle_id, &self.fabric_id, phase, message));
    }

    pub fn completed(&self, message: &str) {
        self.send(CycleProgressEvent::completed(&self.cycle_id, &self.fabric_id, message));
    }

    pub fn failed(&self, error: &str) {
        self.send(CycleProgressEvent::failed(&self.cycle_id, &self.fabric_id, error));
    }

    /// Requests cancellation; the cycle stops at the next unit boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns a clone of the cancellation flag for sharing with other tasks.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn send(&self, event: CycleProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }
}

/// Broadcasts cycle progress events to the presentation layer.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: Arc<broadcast::Sender<CycleProgressEvent>>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a progress tracker for a new cycle.
    pub fn start_cycle(&self, fabric_id: &str) -> CycleProgress {
        CycleProgress::new(fabric_id, Arc::clone(&self.sender))
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
