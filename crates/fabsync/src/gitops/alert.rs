//! Reconciliation alerts: types, lifecycle and priority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::resource::{ManagedResource, ResourceKind};

/// Hours after which an alert stops gaining urgency.
pub const MAX_AGE_FACTOR: i64 = 20;


#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn base_priority(&self) -> i64 {
        match self {
            Severity::Critical => 10,
            Severity::High => 30,
            Severity::Medium => 50,
            Severity::Low => 70,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    DriftDetected,
    OrphanedResource,
    CreationPending,
    DeletionPending,
    SyncFailure,
    ValidationError,
    ConflictDetected,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::DriftDetected => "drift_detected",
            AlertType::OrphanedResource => "orphaned_resource",
            AlertType::CreationPending => "creation_pending",
            AlertType::DeletionPending => "deletion_pending",
            AlertType::SyncFailure => "sync_failure",
            AlertType::ValidationError => "validation_error",
            AlertType::ConflictDetected => "conflict_detected",
        }
    }

    pub fn all() -> &'static [AlertType] {
        &[
            AlertType::DriftDetected,
            AlertType::OrphanedResource,
            AlertType::CreationPending,
            AlertType::DeletionPending,
            AlertType::SyncFailure,
            AlertType::ValidationError,
            AlertType::ConflictDetected,
        ]
    }

    /// Actions that close an alert of this type. `manual_review` is accepted
    /// everywhere but never closes anything.
    pub fn allowed_actions(&self) -> &'static [ResolutionAction] {
        use ResolutionAction::*;
        match self {
            AlertType::DriftDetected => &[UpdateGit, ApplyToCluster, Ignore, Reconciled],
            AlertType::OrphanedResource => &[ImportToGit, DeleteFromCluster, Ignore, Reconciled],
            AlertType::CreationPending | AlertType::DeletionPending => {
                &[ApplyToCluster, DeleteFromCluster, Ignore, Reconciled]
            }
            AlertType::SyncFailure | AlertType::ValidationError | AlertType::ConflictDetected => {
                &[Ignore, Reconciled]
            }
        }
    }

    pub fn allows(&self, action: ResolutionAction) -> bool {
        action == ResolutionAction::ManualReview || self.allowed_actions().contains(&action)
    }

    /// The action the engine may run on its own, if any.
    pub fn auto_action(&self, severity: Severity) -> Option<ResolutionAction> {
        match (self, severity) {
            (AlertType::DriftDetected, Severity::Low) => Some(ResolutionAction::UpdateGit),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertType::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown alert type: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "ACTIVE",
            AlertStatus::Acknowledged => "ACKNOWLEDGED",
            AlertStatus::Resolved => "RESOLVED",
            AlertStatus::Suppressed => "SUPPRESSED",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, AlertStatus::Active | AlertStatus::Acknowledged)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    pub fn can_move_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (
                AlertStatus::Active,
                AlertStatus::Acknowledged | AlertStatus::Resolved | AlertStatus::Suppressed
            ) | (
                AlertStatus::Acknowledged,
                AlertStatus::Resolved | AlertStatus::Suppressed
            )
        )
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(AlertStatus::Active),
            "ACKNOWLEDGED" => Ok(AlertStatus::Acknowledged),
            "RESOLVED" => Ok(AlertStatus::Resolved),
            "SUPPRESSED" => Ok(AlertStatus::Suppressed),
            _ => Err(format!("Unknown alert status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Write the cluster state back to the source tree.
    UpdateGit,
    /// Push the desired state to the cluster.
    ApplyToCluster,
    /// Adopt an orphan into the source tree.
    ImportToGit,
    /// Remove an orphan from the cluster.
    DeleteFromCluster,
    /// Leave it to an operator. Never closes the alert.
    ManualReview,
    Ignore,
    /// The condition cleared without intervention.
    Reconciled,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::UpdateGit => "update_git",
            ResolutionAction::ApplyToCluster => "apply_to_cluster",
            ResolutionAction::ImportToGit => "import_to_git",
            ResolutionAction::DeleteFromCluster => "delete_from_cluster",
            ResolutionAction::ManualReview => "manual_review",
            ResolutionAction::Ignore => "ignore",
            ResolutionAction::Reconciled => "reconciled",
        }
    }

    /// Whether executing the action touches the source tree or the cluster.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            ResolutionAction::UpdateGit
                | ResolutionAction::ApplyToCluster
                | ResolutionAction::ImportToGit
                | ResolutionAction::DeleteFromCluster
        )
    }
}

impl std::fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResolutionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update_git" => Ok(ResolutionAction::UpdateGit),
            "apply_to_cluster" => Ok(ResolutionAction::ApplyToCluster),
            "import_to_git" => Ok(ResolutionAction::ImportToGit),
            "delete_from_cluster" => Ok(ResolutionAction::DeleteFromCluster),
            "manual_review" => Ok(ResolutionAction::ManualReview),
            "ignore" => Ok(ResolutionAction::Ignore),
            "reconciled" => Ok(ResolutionAction::Reconciled),
            other => Err(format!("Unknown resolution action: {}", other)),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlertError {
    #[error("Alert {id} cannot move from {from} to {to}")]
    InvalidStatus {
        id: String,
        from: AlertStatus,
        to: AlertStatus,
    },

    #[error("Action {action} is not allowed for {alert_type} alerts")]
    ActionNotAllowed {
        action: ResolutionAction,
        alert_type: AlertType,
    },

    #[error("Alert not found: {0}")]
    NotFound(String),

    #[error("Action {0} changes the source tree or the cluster and must be executed")]
    RequiresExecution(ResolutionAction),
}

/// Priority for an alert of `severity` raised at `created_at`.
///
/// Lower numbers are handled sooner. Each hour of age lowers the number by
/// one, up to [`MAX_AGE_FACTOR`]. An aged HIGH alert can tie a fresh
/// CRITICAL one; [`sort_by_priority`] still puts critical alerts first.
pub fn priority(severity: Severity, created_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let age_hours = (now - created_at).num_hours().clamp(0, MAX_AGE_FACTOR);
    (severity.base_priority() - age_hours).max(1)
}

/// A reconciliation alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub fabric_id: String,
    pub resource_id: Option<String>,
    pub resource_kind: Option<ResourceKind>,
    pub resource_name: Option<String>,
    /// De-duplication subject for alerts that are not tied to a resource.
    pub subject: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub status: AlertStatus,
    pub priority: i64,
    pub message: String,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_action: Option<ResolutionAction>,
    pub suppression_reason: Option<String>,
    pub batch_id: Option<String>,
}

impl Alert {
    /// A fabric-level alert, keyed by `subject`.
    pub fn new(
        fabric_id: &str,
        alert_type: AlertType,
        severity: Severity,
        subject: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fabric_id: fabric_id.to_string(),
            resource_id: None,
            resource_kind: None,
            resource_name: None,
            subject: subject.into(),
            alert_type,
            severity,
            status: AlertStatus::Active,
            priority: priority(severity, now, now),
            message: message.into(),
            details: None,
            created_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolved_action: None,
            suppression_reason: None,
            batch_id: None,
        }
    }

    /// An alert about a specific resource.
    pub fn for_resource(
        resource: &ManagedResource,
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut alert = Self::new(
            &resource.fabric_id,
            alert_type,
            severity,
            resource.identity().to_string(),
            message,
            now,
        );
        alert.resource_id = Some(resource.id.clone());
        alert.resource_kind = Some(resource.kind);
        alert.resource_name = Some(resource.name.clone());
        alert
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    fn move_to(&self, next: AlertStatus) -> Result<(), AlertError> {
        if self.status.can_move_to(next) {
            Ok(())
        } else {
            Err(AlertError::InvalidStatus {
                id: self.id.clone(),
                from: self.status,
                to: next,
            })
        }
    }

    pub fn acknowledge(&mut self, by: &str, now: DateTime<Utc>) -> Result<(), AlertError> {
        self.move_to(AlertStatus::Acknowledged)?;
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at = Some(now);
        self.acknowledged_by = Some(by.to_string());
        Ok(())
    }

    /// Records a resolution. Returns `false` when the action leaves the alert
    /// open (`manual_review`).
    pub fn resolve(
        &mut self,
        action: ResolutionAction,
        by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AlertError> {
        if !self.alert_type.allows(action) {
            return Err(AlertError::ActionNotAllowed {
                action,
                alert_type: self.alert_type,
            });
        }
        if action == ResolutionAction::ManualReview {
            if !self.is_open() {
                return Err(AlertError::InvalidStatus {
                    id: self.id.clone(),
                    from: self.status,
                    to: self.status,
                });
            }
            return Ok(false);
        }
        self.move_to(AlertStatus::Resolved)?;
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolved_by = Some(by.to_string());
        self.resolved_action = Some(action);
        Ok(true)
    }

    pub fn suppress(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), AlertError> {
        self.move_to(AlertStatus::Suppressed)?;
        self.status = AlertStatus::Suppressed;
        self.suppression_reason = Some(reason.to_string());
        self.resolved_at = Some(now);
        Ok(())
    }

    pub fn refresh_priority(&mut self, now: DateTime<Utc>) {
        self.priority = priority(self.severity, self.created_at, now);
    }

    /// Key under which alerts are batched for remediation.
    pub fn batch_key(&self) -> BatchKey {
        BatchKey {
            alert_type: self.alert_type,
            fabric_id: self.fabric_id.clone(),
            kind: self.resource_kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchKey {
    pub alert_type: AlertType,
    pub fabric_id: String,
    pub kind: Option<ResourceKind>,
}

/// Sorts alerts by urgency: critical first, then priority, then age.
pub fn sort_by_priority(alerts: &mut [Alert], now: DateTime<Utc>) {
    for alert in alerts.iter_mut() {
        alert.refresh_priority(now);
    }
    alerts.sort_by(|a, b| {
        let a_critical = a.severity == Severity::Critical;
        let b_critical = b.severity == Severity::Critical;
        b_critical
            .cmp(&a_critical)
            .then(a.priority.cmp(&b.priority))
            .then(a.created_at.cmp(&b.created_at))
    });
}
