//! GitOps reconciliation for fabric resources.
//!
//! Desired state lives as YAML records in a source tree, observed state in
//! the cluster. This module provides:
//! - Ingestion of raw multi-document YAML into managed records
//! - The resource lifecycle state machine and drift detection
//! - Alerting with priority ordering and batch remediation
//! - The periodic sync orchestrator and its scheduler

pub mod alert;
pub mod alert_manager;
pub mod cluster;
pub mod drift;
pub mod error;
pub mod fabric;
pub mod index;
pub mod ingest;
pub mod lifecycle;
pub mod progress;
pub mod reconciler;
pub mod remediation;
pub mod resource;
pub mod source;
pub mod sync_scheduler;
pub mod watcher;

pub use alert::{Alert, AlertError, AlertStatus, AlertType, ResolutionAction, Severity};
pub use alert_manager::{AlertDelta, AlertManager, AuditFinding, Batch, RaiseOutcome};
pub use cluster::{ClusterClient, ClusterError, ClusterObject, InMemoryCluster};
pub use drift::DriftReport;
pub use error::{GitOpsError, Result};
pub use fabric::{ConnectionStatus, Fabric, FabricCounts, SyncStatus};
pub use ingest::{IngestionProcessor, IngestionResult};
pub use lifecycle::{Transition, TransitionError, Trigger};
pub use progress::{CyclePhase, CycleProgress, CycleProgressEvent, ProgressBroadcaster};
pub use reconciler::{CycleReport, SyncOrchestrator};
pub use remediation::{ActionOutcome, BatchResult, Remediator};
pub use resource::{
    DriftDetails, DriftStatus, ManagedRecord, ManagedResource, ObjectMeta, ResourceIdentity,
    ResourceKind, ResourceState, SpecDocument,
};
pub use source::{LocalFileTree, SourceError, SourceTree};
pub use sync_scheduler::SyncScheduler;
pub use watcher::{BackgroundWatcher, SourceWatcher};
