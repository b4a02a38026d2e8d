//! Alert bookkeeping on top of the record store.
//!
//! The manager raises, de-duplicates, resolves and batches alerts. It never
//! touches the source tree or the cluster; actions with side effects are run
//! by [`crate::gitops::remediation::Remediator`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use super::alert::{self, Alert, AlertError, AlertType, BatchKey, ResolutionAction, Severity};
use super::drift;
use super::error::Result;
use super::resource::{DriftStatus, ManagedResource, ResourceState, MANAGER_NAME};
use crate::db::{alert_repo, resource_repo, Database, DatabaseError};

/// Alert types the engine opens and closes on its own from resource state.
const STATE_ALERTS: &[AlertType] = &[
    AlertType::DriftDetected,
    AlertType::OrphanedResource,
    AlertType::CreationPending,
];

/// What [`AlertManager::raise`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum RaiseOutcome {
    /// A new alert was stored.
    Created(Alert),
    /// An open alert already covers the condition.
    Existing(Alert),
    /// The open alert's severity changed and was updated in place.
    Updated(Alert),
}

impl RaiseOutcome {
    pub fn alert(&self) -> &Alert {
        match self {
            RaiseOutcome::Created(a) | RaiseOutcome::Existing(a) | RaiseOutcome::Updated(a) => a,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, RaiseOutcome::Created(_))
    }
}

/// Alert changes made while evaluating one or more resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDelta {
    pub created: usize,
    pub updated: usize,
    pub resolved: usize,
}

impl AlertDelta {
    pub fn merge(&mut self, other: AlertDelta) {
        self.created += other.created;
        self.updated += other.updated;
        self.resolved += other.resolved;
    }

    pub(crate) fn count(&mut self, outcome: &RaiseOutcome) {
        match outcome {
            RaiseOutcome::Created(_) => self.created += 1,
            RaiseOutcome::Updated(_) => self.updated += 1,
            RaiseOutcome::Existing(_) => {}
        }
    }
}

/// A DRIFTED or ORPHANED resource without an open alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFinding {
    pub resource_id: String,
    pub identity: String,
    pub state: ResourceState,
}

/// Open alerts sharing a [`BatchKey`], most urgent first.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub key: BatchKey,
    pub alerts: Vec<Alert>,
}

#[derive(Clone)]
pub struct AlertManager {
    db: Database,
    fabric_id: String,
}

impl AlertManager {
    pub fn new(db: Database, fabric_id: impl Into<String>) -> Self {
        Self {
            db,
            fabric_id: fabric_id.into(),
        }
    }

    pub fn fabric_id(&self) -> &str {
        &self.fabric_id
    }

    /// Stores `alert` unless an open alert already covers the same
    /// condition. A severity change on the open alert is applied in place.
    pub fn raise(&self, alert: Alert) -> Result<RaiseOutcome> {
        let outcome = self.db.with_tx(|tx| {
            let existing = alert_repo::find_open_in(
                tx,
                &alert.fabric_id,
                alert.alert_type,
                alert.resource_id.as_deref(),
                &alert.subject,
            )?;

            match existing {
                Some(mut open) if open.severity != alert.severity => {
                    open.severity = alert.severity;
                    open.message = alert.message.clone();
                    open.details = alert.details.clone();
                    open.refresh_priority(alert.created_at);
                    alert_repo::update_in(tx, &open)?;
                    Ok(RaiseOutcome::Updated(open))
                }
                Some(open) => Ok(RaiseOutcome::Existing(open)),
                None => {
                    alert_repo::insert_in(tx, &alert)?;
                    Ok(RaiseOutcome::Created(alert))
                }
            }
        })?;

        if let RaiseOutcome::Created(a) | RaiseOutcome::Updated(a) = &outcome {
            log::info!(
                "Alert {} [{}] {} for {}: {}",
                a.alert_type,
                a.severity,
                if outcome.is_created() { "raised" } else { "updated" },
                a.subject,
                a.message
            );
        }
        Ok(outcome)
    }

    fn load(&self, id: &str) -> Result<Alert> {
        alert_repo::find_by_id(&self.db, id)?
            .ok_or_else(|| AlertError::NotFound(id.to_string()).into())
    }

    pub fn acknowledge(&self, id: &str, by: &str, now: DateTime<Utc>) -> Result<Alert> {
        let mut alert = self.load(id)?;
        alert.acknowledge(by, now)?;
        alert_repo::update(&self.db, &alert)?;
        Ok(alert)
    }

    pub fn suppress(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<Alert> {
        let mut alert = self.load(id)?;
        alert.suppress(reason, now)?;
        alert_repo::update(&self.db, &alert)?;
        log::info!("Alert {} suppressed: {}", id, reason);
        Ok(alert)
    }

    /// Records a resolution that needs no side effects. Actions that change
    /// the source tree or the cluster are refused here.
    pub fn resolve(
        &self,
        id: &str,
        action: ResolutionAction,
        by: &str,
        now: DateTime<Utc>,
    ) -> Result<Alert> {
        if action.has_side_effects() {
            return Err(AlertError::RequiresExecution(action).into());
        }
        self.record_resolution(id, action, by, now)
    }

    /// Records a resolution whose side effects (if any) already happened.
    pub(crate) fn record_resolution(
        &self,
        id: &str,
        action: ResolutionAction,
        by: &str,
        now: DateTime<Utc>,
    ) -> Result<Alert> {
        let mut alert = self.load(id)?;
        if alert.resolve(action, by, now)? {
            alert_repo::update(&self.db, &alert)?;
            log::info!("Alert {} resolved by {} ({})", id, by, action);
        }
        Ok(alert)
    }

    /// Closes the open alert for a condition, if any, as `reconciled`.
    pub fn clear(
        &self,
        alert_type: AlertType,
        resource_id: Option<&str>,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let closed = self.db.with_tx(|tx| {
            let Some(mut open) =
                alert_repo::find_open_in(tx, &self.fabric_id, alert_type, resource_id, subject)?
            else {
                return Ok(false);
            };
            close_reconciled(tx, &mut open, now)?;
            Ok(true)
        })?;
        if closed {
            log::info!("Alert {} for {} cleared", alert_type, subject);
        }
        Ok(closed)
    }

    /// Closes a resource's open alerts of the given types as `reconciled`.
    pub fn resolve_for_resource(
        &self,
        resource_id: &str,
        types: &[AlertType],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let closed = self.db.with_tx(|tx| {
            let mut closed = 0;
            for mut open in alert_repo::list_open_for_resource_in(tx, resource_id)? {
                if types.contains(&open.alert_type) {
                    close_reconciled(tx, &mut open, now)?;
                    closed += 1;
                }
            }
            Ok(closed)
        })?;
        if closed > 0 {
            log::debug!("Resolved {} alert(s) for resource {}", closed, resource_id);
        }
        Ok(closed)
    }

    /// Open alerts, critical first, then by priority and age. Priorities
    /// are recomputed for `now` and stored.
    pub fn list_open(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let alerts = self.db.with_tx(|tx| {
            let mut alerts = alert_repo::list_open_in(tx, &self.fabric_id)?;
            let stored: HashMap<String, i64> =
                alerts.iter().map(|a| (a.id.clone(), a.priority)).collect();
            alert::sort_by_priority(&mut alerts, now);
            for alert in &alerts {
                if stored.get(&alert.id) != Some(&alert.priority) {
                    alert_repo::update_in(tx, alert)?;
                }
            }
            Ok(alerts)
        })?;
        Ok(alerts)
    }

    /// Opens, updates or closes the state-driven alerts of `resource`.
    pub fn evaluate_resource(
        &self,
        resource: &ManagedResource,
        now: DateTime<Utc>,
    ) -> Result<AlertDelta> {
        let mut delta = AlertDelta::default();

        let wanted = match resource.state {
            ResourceState::Drifted => {
                let severity = drift::classify(resource.drift_score);
                let keys = resource
                    .drift_details
                    .as_ref()
                    .map(|d| d.keys().join(", "))
                    .unwrap_or_default();
                let alert = Alert::for_resource(
                    resource,
                    AlertType::DriftDetected,
                    severity,
                    format!(
                        "{} drifted from desired state (score {:.2}; keys: {})",
                        resource.identity(),
                        resource.drift_score,
                        keys
                    ),
                    now,
                )
                .with_details(json!({
                    "driftScore": resource.drift_score,
                    "driftStatus": resource.drift_status,
                    "driftDetails": resource.drift_details,
                }));
                Some(alert)
            }
            ResourceState::Orphaned => Some(Alert::for_resource(
                resource,
                AlertType::OrphanedResource,
                Severity::Critical,
                format!("{} exists in the cluster but not in the source tree", resource.identity()),
                now,
            )),
            ResourceState::Pending if resource.drift_status == DriftStatus::CreationPending => {
                Some(Alert::for_resource(
                    resource,
                    AlertType::CreationPending,
                    Severity::Low,
                    format!("{} is declared but not yet present in the cluster", resource.identity()),
                    now,
                ))
            }
            _ => None,
        };

        let keep = wanted.as_ref().map(|a| a.alert_type);
        let stale: Vec<AlertType> = STATE_ALERTS
            .iter()
            .copied()
            .filter(|t| Some(*t) != keep)
            .collect();
        delta.resolved += self.resolve_for_resource(&resource.id, &stale, now)?;

        if let Some(alert) = wanted {
            delta.count(&self.raise(alert)?);
        }
        Ok(delta)
    }

    /// DRIFTED and ORPHANED resources that lack an open alert.
    pub fn audit(&self) -> Result<Vec<AuditFinding>> {
        let resources = resource_repo::list_by_fabric(&self.db, &self.fabric_id)?;
        let mut findings = Vec::new();
        for resource in resources.iter().filter(|r| r.state.requires_alert()) {
            let open = self
                .db
                .with_conn(|conn| alert_repo::list_open_for_resource_in(conn, &resource.id))?;
            if open.is_empty() {
                findings.push(AuditFinding {
                    resource_id: resource.id.clone(),
                    identity: resource.identity().to_string(),
                    state: resource.state,
                });
            }
        }
        if !findings.is_empty() {
            log::warn!("Alert audit found {} resource(s) without an open alert", findings.len());
        }
        Ok(findings)
    }

    /// Raises the alerts [`Self::audit`] reports as missing.
    pub fn repair(&self, now: DateTime<Utc>) -> Result<AlertDelta> {
        let mut delta = AlertDelta::default();
        for finding in self.audit()? {
            let Some(resource) = resource_repo::find_by_id(&self.db, &finding.resource_id)? else {
                continue;
            };
            delta.merge(self.evaluate_resource(&resource, now)?);
        }
        Ok(delta)
    }

    /// Groups open alerts by type, fabric and kind, stamps each group with a
    /// fresh batch id, and orders groups by their most urgent member.
    pub fn plan_batches(&self, now: DateTime<Utc>) -> Result<Vec<Batch>> {
        let alerts = self.list_open(now)?;

        let mut batches: Vec<Batch> = Vec::new();
        for alert in alerts {
            let key = alert.batch_key();
            match batches.iter_mut().find(|b| b.key == key) {
                Some(batch) => batch.alerts.push(alert),
                None => batches.push(Batch {
                    id: uuid::Uuid::new_v4().to_string(),
                    key,
                    alerts: vec![alert],
                }),
            }
        }

        self.db.with_tx(|tx| {
            for batch in &mut batches {
                for alert in &mut batch.alerts {
                    alert.batch_id = Some(batch.id.clone());
                    alert_repo::update_in(tx, alert)?;
                }
            }
            Ok::<_, DatabaseError>(())
        })?;

        log::debug!("Planned {} remediation batch(es)", batches.len());
        Ok(batches)
    }
}

fn close_reconciled(
    conn: &rusqlite::Connection,
    alert: &mut Alert,
    now: DateTime<Utc>,
) -> std::result::Result<(), DatabaseError> {
    // Reconciled is allowed for every type, so only the status can refuse.
    match alert.resolve(ResolutionAction::Reconciled, MANAGER_NAME, now) {
        Ok(_) => alert_repo::update_in(conn, alert),
        Err(e) => {
            log::warn!("Alert {} left as {}: {}", alert.id, alert.status, e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::alert::AlertStatus;
    use crate::gitops::lifecycle::{transition, Trigger};
    use crate::gitops::resource::{ResourceIdentity, ResourceKind, SpecDocument};
    use chrono::Duration;

    fn setup() -> (Database, AlertManager) {
        let db = Database::open_in_memory().unwrap();
        let manager = AlertManager::new(db.clone(), "f1");
        (db, manager)
    }

    fn stored(db: &Database, state: ResourceState, name: &str) -> ManagedResource {
        let now = Utc::now();
        let mut r = ManagedResource::discovered(
            "f1",
            &ResourceIdentity::new(ResourceKind::Vpc, "default", name),
            SpecDocument::new().with("vlan", 10).with("subnet", "10.0.0.0/24"),
            None,
            now,
        );
        if state == ResourceState::Drifted {
            r.desired_spec = Some(SpecDocument::new().with("vlan", 11).with("subnet", "10.0.0.0/24"));
            r.desired_commit = Some("c1".into());
            let report = drift::detect(r.desired_spec.as_ref(), r.actual_spec.as_ref()).unwrap();
            r.drift_score = report.score;
            r.drift_status = report.status;
            r.drift_details = Some(report.details);
            r.state = ResourceState::Drifted;
        }
        resource_repo::insert(&db, &r, "test").unwrap();
        r
    }

    fn failure(subject: &str, severity: Severity) -> Alert {
        Alert::new("f1", AlertType::SyncFailure, severity, subject, "down", Utc::now())
    }

    #[test]
    fn test_raise_deduplicates_open_conditions() {
        let (_db, manager) = setup();
        assert!(manager.raise(failure("cluster", Severity::High)).unwrap().is_created());
        assert!(matches!(
            manager.raise(failure("cluster", Severity::High)).unwrap(),
            RaiseOutcome::Existing(_)
        ));
        assert!(matches!(
            manager.raise(failure("cluster", Severity::Critical)).unwrap(),
            RaiseOutcome::Updated(_)
        ));

        let open = manager.list_open(Utc::now()).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, Severity::Critical);
    }

    #[test]
    fn test_resolve_refuses_side_effects() {
        let (_db, manager) = setup();
        let alert = manager.raise(failure("cluster", Severity::High)).unwrap().alert().clone();

        let err = manager
            .resolve(&alert.id, ResolutionAction::UpdateGit, "ops", Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::gitops::GitOpsError::Alert(AlertError::RequiresExecution(ResolutionAction::UpdateGit))
        ));

        let kept = manager
            .resolve(&alert.id, ResolutionAction::ManualReview, "ops", Utc::now())
            .unwrap();
        assert_eq!(kept.status, AlertStatus::Active);

        let done = manager
            .resolve(&alert.id, ResolutionAction::Ignore, "ops", Utc::now())
            .unwrap();
        assert_eq!(done.status, AlertStatus::Resolved);
        assert_eq!(done.resolved_action, Some(ResolutionAction::Ignore));

        // terminal
        assert!(manager.acknowledge(&alert.id, "ops", Utc::now()).is_err());
        assert!(manager.suppress(&alert.id, "noise", Utc::now()).is_err());
    }

    #[test]
    fn test_acknowledge_then_suppress() {
        let (_db, manager) = setup();
        let alert = manager.raise(failure("cluster", Severity::High)).unwrap().alert().clone();
        let acked = manager.acknowledge(&alert.id, "ops", Utc::now()).unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert_eq!(manager.list_open(Utc::now()).unwrap().len(), 1);

        let suppressed = manager.suppress(&alert.id, "maintenance", Utc::now()).unwrap();
        assert_eq!(suppressed.status, AlertStatus::Suppressed);
        assert!(manager.list_open(Utc::now()).unwrap().is_empty());
        assert!(matches!(
            manager.acknowledge("missing", "ops", Utc::now()),
            Err(crate::gitops::GitOpsError::Alert(AlertError::NotFound(_)))
        ));
    }

    #[test]
    fn test_close_reconciled_leaves_terminal_alert_untouched() {
        let (db, manager) = setup();
        let mut alert = failure("cluster", Severity::High);
        manager.raise(alert.clone()).unwrap();
        alert.suppress("noise", Utc::now()).unwrap();
        alert_repo::update(&db, &alert).unwrap();

        db.with_conn(|conn| close_reconciled(conn, &mut alert, Utc::now()))
            .unwrap();
        let stored = alert_repo::find_by_id(&db, &alert.id).unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Suppressed);
        assert_eq!(stored.resolved_action, None);
    }

    #[test]
    fn test_list_open_orders_critical_first_and_persists_priority() {
        let (db, manager) = setup();
        let now = Utc::now();
        let mut old_high = failure("old", Severity::High);
        old_high.created_at = now - Duration::hours(30);
        manager.raise(old_high.clone()).unwrap();
        manager.raise(failure("new-critical", Severity::Critical)).unwrap();
        manager.raise(failure("low", Severity::Low)).unwrap();

        let open = manager.list_open(now).unwrap();
        let subjects: Vec<&str> = open.iter().map(|a| a.subject.as_str()).collect();
        assert_eq!(subjects, vec!["new-critical", "old", "low"]);

        let reloaded = alert_repo::find_by_id(&db, &old_high.id).unwrap().unwrap();
        assert_eq!(reloaded.priority, 10);

        // the stored order keeps the critical alert ahead of the tie
        let stored = alert_repo::list_open(&db, manager.fabric_id()).unwrap();
        assert_eq!(stored[0].subject, "new-critical");
        assert_eq!(stored[1].subject, "old");
    }

    #[test]
    fn test_evaluate_resource_follows_state() {
        let (db, manager) = setup();
        let now = Utc::now();
        let drifted = stored(&db, ResourceState::Drifted, "vpc-1");

        let delta = manager.evaluate_resource(&drifted, now).unwrap();
        assert_eq!(delta.created, 1);
        let open = alert_repo::list_for_resource(&db, &drifted.id).unwrap();
        assert_eq!(open[0].alert_type, AlertType::DriftDetected);
        assert_eq!(open[0].severity, drift::classify(drifted.drift_score));

        // second evaluation is a no-op
        assert_eq!(manager.evaluate_resource(&drifted, now).unwrap(), AlertDelta::default());

        let healed = transition(
            &drifted,
            Trigger::ReconciliationConfirmed {
                desired: drifted.actual_spec.clone(),
                commit: Some("c2".into()),
            },
            now,
        )
        .unwrap()
        .resource;
        let delta = manager.evaluate_resource(&healed, now).unwrap();
        assert_eq!(delta.resolved, 1);
        let closed = alert_repo::find_by_id(&db, &open[0].id).unwrap().unwrap();
        assert_eq!(closed.resolved_action, Some(ResolutionAction::Reconciled));
        assert_eq!(closed.resolved_by.as_deref(), Some(MANAGER_NAME));
    }

    #[test]
    fn test_audit_and_repair() {
        let (db, manager) = setup();
        let orphan = stored(&db, ResourceState::Orphaned, "stray");
        stored(&db, ResourceState::Drifted, "vpc-2");

        let findings = manager.audit().unwrap();
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().any(|f| f.resource_id == orphan.id));

        let delta = manager.repair(Utc::now()).unwrap();
        assert_eq!(delta.created, 2);
        assert!(manager.audit().unwrap().is_empty());

        let alerts = alert_repo::list_for_resource(&db, &orphan.id).unwrap();
        assert_eq!(alerts[0].alert_type, AlertType::OrphanedResource);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn test_plan_batches_groups_by_type_and_kind() {
        let (db, manager) = setup();
        let now = Utc::now();
        for name in ["a", "b"] {
            let r = stored(&db, ResourceState::Orphaned, name);
            manager.evaluate_resource(&r, now).unwrap();
        }
        let d = stored(&db, ResourceState::Drifted, "c");
        manager.evaluate_resource(&d, now).unwrap();
        manager.raise(failure("cluster", Severity::High)).unwrap();

        let batches = manager.plan_batches(now).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].key.alert_type, AlertType::OrphanedResource);
        assert_eq!(batches[0].alerts.len(), 2);

        for batch in &batches {
            for alert in &batch.alerts {
                let stored = alert_repo::find_by_id(&db, &alert.id).unwrap().unwrap();
                assert_eq!(stored.batch_id.as_deref(), Some(batch.id.as_str()));
            }
        }
    }

    #[test]
    fn test_clear_closes_subject_alert() {
        let (_db, manager) = setup();
        manager.raise(failure("cluster", Severity::High)).unwrap();
        assert!(manager.clear(AlertType::SyncFailure, None, "cluster", Utc::now()).unwrap());
        assert!(!manager.clear(AlertType::SyncFailure, None, "cluster", Utc::now()).unwrap());
        assert!(manager.list_open(Utc::now()).unwrap().is_empty());
    }
}
