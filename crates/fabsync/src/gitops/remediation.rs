//! Execution of alert resolution actions.
//!
//! Members of a batch run concurrently, bounded by `concurrency`, each under
//! its own timeout. Every action either completes its record-store commit or
//! leaves the record untouched; a failed or timed-out member raises a
//! sync_failure alert and leaves its original alert open.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tracing::Instrument;

use super::alert::{Alert, AlertError, AlertType, ResolutionAction, Severity};
use super::alert_manager::{AlertManager, Batch};
use super::cluster::{ClusterClient, ClusterError, ClusterObject};
use super::error::{GitOpsError, Result};
use super::ingest;
use super::lifecycle::{self, Trigger};
use super::resource::{DriftStatus, ManagedRecord, ManagedResource, ResourceState, MANAGER_NAME};
use super::source::{self, SourceError, SourceTree};
use crate::db::{resource_repo, Database};

/// Attempts at committing an apply result when the record keeps changing.
const COMMIT_ATTEMPTS: u32 = 3;

/// Outcome of one action on one alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub alert_id: String,
    pub resource_id: Option<String>,
    pub action: ResolutionAction,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of a batch; partial success is normal.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: Option<String>,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<ActionOutcome>,
}

impl BatchResult {
    fn push(&mut self, outcome: ActionOutcome) {
        if outcome.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }
}

pub struct Remediator {
    db: Database,
    fabric_id: String,
    source: Arc<dyn SourceTree>,
    cluster: Arc<dyn ClusterClient>,
    alerts: AlertManager,
    concurrency: usize,
    action_timeout: Duration,
}

impl Remediator {
    pub fn new(
        db: Database,
        fabric_id: impl Into<String>,
        source: Arc<dyn SourceTree>,
        cluster: Arc<dyn ClusterClient>,
        concurrency: usize,
        action_timeout: Duration,
    ) -> Self {
        let fabric_id = fabric_id.into();
        Self {
            alerts: AlertManager::new(db.clone(), fabric_id.clone()),
            db,
            fabric_id,
            source,
            cluster,
            concurrency: concurrency.max(1),
            action_timeout,
        }
    }

    /// Runs `action` on every member of `batch`.
    pub async fn execute_batch(
        &self,
        batch: &Batch,
        action: ResolutionAction,
        by: &str,
    ) -> Result<BatchResult> {
        if !batch.key.alert_type.allows(action) {
            return Err(AlertError::ActionNotAllowed {
                action,
                alert_type: batch.key.alert_type,
            }
            .into());
        }

        log::info!(
            "Executing {} on batch {} ({} alert(s) of type {})",
            action,
            batch.id,
            batch.alerts.len(),
            batch.key.alert_type
        );

        let jobs = batch.alerts.iter().cloned().map(|a| (a, action)).collect();
        let span = tracing::info_span!("remediate", batch = %batch.id, action = %action);
        let mut result = self.run_all(jobs, by).instrument(span).await;
        result.batch_id = Some(batch.id.clone());
        Ok(result)
    }

    /// Runs `action` on a single alert, as requested by an operator.
    pub async fn execute(
        &self,
        alert_id: &str,
        action: ResolutionAction,
        by: &str,
    ) -> Result<ActionOutcome> {
        let alert = crate::db::alert_repo::find_by_id(&self.db, alert_id)?
            .ok_or_else(|| AlertError::NotFound(alert_id.to_string()))?;
        if !alert.alert_type.allows(action) {
            return Err(AlertError::ActionNotAllowed {
                action,
                alert_type: alert.alert_type,
            }
            .into());
        }
        Ok(self.run_member(alert, action, by).await)
    }

    /// Runs the automatic action of every open alert that has one.
    pub async fn run_auto(&self, now: DateTime<Utc>) -> Result<BatchResult> {
        let jobs: Vec<(Alert, ResolutionAction)> = self
            .alerts
            .list_open(now)?
            .into_iter()
            .filter_map(|a| a.alert_type.auto_action(a.severity).map(|action| (a, action)))
            .collect();
        if jobs.is_empty() {
            return Ok(BatchResult::default());
        }
        log::info!("Auto-remediating {} alert(s)", jobs.len());
        Ok(self.run_all(jobs, MANAGER_NAME).await)
    }

    async fn run_all(&self, jobs: Vec<(Alert, ResolutionAction)>, by: &str) -> BatchResult {
        let outcomes: Vec<ActionOutcome> = stream::iter(jobs)
            .map(|(alert, action)| self.run_member(alert, action, by))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut result = BatchResult::default();
        for outcome in outcomes {
            result.push(outcome);
        }
        result
    }

    async fn run_member(&self, alert: Alert, action: ResolutionAction, by: &str) -> ActionOutcome {
        let mut outcome = ActionOutcome {
            alert_id: alert.id.clone(),
            resource_id: alert.resource_id.clone(),
            action,
            success: false,
            error: None,
        };

        let run = tokio::time::timeout(self.action_timeout, self.perform(&alert, action, by)).await;
        let error = match run {
            Ok(Ok(())) => {
                outcome.success = true;
                return outcome;
            }
            Ok(Err(e)) => e,
            Err(_) => GitOpsError::ActionTimeout {
                action: action.to_string(),
                secs: self.action_timeout.as_secs(),
            },
        };

        log::warn!("{} on alert {} failed: {}", action, alert.id, error);
        if let Err(raise_err) = self.raise_failure(&alert, action, &error) {
            log::error!("Failed to record sync failure for alert {}: {}", alert.id, raise_err);
        }
        outcome.error = Some(error.to_string());
        outcome
    }

    async fn perform(&self, alert: &Alert, action: ResolutionAction, by: &str) -> Result<()> {
        if !action.has_side_effects() {
            self.alerts
                .record_resolution(&alert.id, action, by, Utc::now())?;
            return Ok(());
        }

        let resource_id = alert.resource_id.as_deref().ok_or_else(|| GitOpsError::ActionRejected {
            action: action.to_string(),
            reason: format!("alert {} is not attached to a resource", alert.id),
        })?;
        let resource = resource_repo::find_by_id(&self.db, resource_id)?
            .ok_or_else(|| GitOpsError::ResourceNotFound(resource_id.to_string()))?;

        match action {
            ResolutionAction::UpdateGit => self.update_git(&resource)?,
            ResolutionAction::ApplyToCluster => self.apply_to_cluster(&resource).await?,
            ResolutionAction::ImportToGit => self.import_to_git(&resource)?,
            ResolutionAction::DeleteFromCluster => self.delete_from_cluster(&resource).await?,
            ResolutionAction::ManualReview | ResolutionAction::Ignore | ResolutionAction::Reconciled => {}
        }

        let now = Utc::now();
        self.alerts.record_resolution(&alert.id, action, by, now)?;
        self.alerts
            .resolve_for_resource(resource_id, &[AlertType::SyncFailure], now)?;
        if action == ResolutionAction::DeleteFromCluster && resource.state == ResourceState::Orphaned {
            self.alerts
                .resolve_for_resource(resource_id, AlertType::all(), now)?;
        }
        Ok(())
    }

    /// Writes the cluster state back to the resource's record, then marks
    /// the drift reconciled. The old record is restored if the commit fails.
    fn update_git(&self, resource: &ManagedResource) -> Result<()> {
        let rejected = |reason: &str| GitOpsError::ActionRejected {
            action: ResolutionAction::UpdateGit.to_string(),
            reason: format!("{}: {}", resource.identity(), reason),
        };
        if resource.drift_status == DriftStatus::DesiredOnly {
            return Err(rejected("the resource is missing from the cluster"));
        }
        let actual = resource
            .actual_spec
            .clone()
            .ok_or_else(|| rejected("no actual spec observed"))?;

        let now = Utc::now();
        let path = resource
            .source_path
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(resource.kind.directory()).join(format!("{}.yaml", resource.name))
            });
        let previous = match self.source.read(&path) {
            Ok(bytes) => Some(bytes),
            Err(SourceError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let record = previous
            .as_deref()
            .and_then(|bytes| serde_yaml::from_slice::<ManagedRecord>(bytes).ok())
            .map(|mut record| {
                record.spec = actual.clone();
                record
            })
            .unwrap_or_else(|| {
                ingest::record_for(&resource.identity(), &self.fabric_id, actual.clone(), now)
            });

        let commit = source::commit_id(self.source.as_ref(), now);
        let mut step = lifecycle::transition(
            resource,
            Trigger::ReconciliationConfirmed {
                desired: Some(actual),
                commit: Some(commit),
            },
            now,
        )?;
        step.resource.source_path = Some(path.display().to_string());

        self.source.write(&path, &ingest::render_record(&record)?)?;
        if let Err(e) = resource_repo::commit_transition(&self.db, &step, &now) {
            let restored = match &previous {
                Some(bytes) => self.source.write(&path, bytes),
                None => self.source.remove(&path),
            };
            if let Err(restore_err) = restored {
                log::error!("Failed to restore {}: {}", path.display(), restore_err);
            }
            return Err(e.into());
        }

        log::info!("Wrote cluster state of {} to {}", resource.identity(), path.display());
        Ok(())
    }

    /// Applies the desired spec and confirms the observed result.
    async fn apply_to_cluster(&self, resource: &ManagedResource) -> Result<()> {
        let desired = resource
            .desired_spec
            .clone()
            .ok_or_else(|| GitOpsError::ActionRejected {
                action: ResolutionAction::ApplyToCluster.to_string(),
                reason: format!("{} has no desired spec", resource.identity()),
            })?;

        let object = ClusterObject::new(&resource.identity(), desired.clone());
        let status = self.cluster.apply(&object).await?;
        log::info!("Applied {} to {}", resource.identity(), self.cluster.name());

        let mut current = resource.clone();
        for attempt in 1..=COMMIT_ATTEMPTS {
            let now = Utc::now();
            let mut triggers = vec![Trigger::ObserveActual {
                actual: desired.clone(),
                status: status.clone(),
            }];
            match current.state {
                ResourceState::Drifted => triggers.push(Trigger::ReconciliationConfirmed {
                    desired: None,
                    commit: None,
                }),
                ResourceState::Pending => triggers.push(Trigger::ApplyConfirmed),
                _ => {}
            }

            let steps = lifecycle::chain(&current, triggers, now)?;
            match resource_repo::commit_transitions(&self.db, &steps, &now) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < COMMIT_ATTEMPTS => {
                    log::debug!("Record of {} changed during apply, reloading", resource.identity());
                    current = resource_repo::find_by_id(&self.db, &resource.id)?
                        .ok_or_else(|| GitOpsError::ResourceNotFound(resource.id.clone()))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(GitOpsError::Contention(resource.identity().to_string()))
    }

    /// Writes an orphan's cluster state as a new record and adopts it.
    fn import_to_git(&self, resource: &ManagedResource) -> Result<()> {
        let actual = resource
            .actual_spec
            .clone()
            .ok_or_else(|| GitOpsError::ActionRejected {
                action: ResolutionAction::ImportToGit.to_string(),
                reason: format!("{} has no actual spec", resource.identity()),
            })?;

        let now = Utc::now();
        let commit = source::commit_id(self.source.as_ref(), now);
        let mut step = lifecycle::transition(resource, Trigger::Import { commit }, now)?;

        let record = ingest::record_for(&resource.identity(), &self.fabric_id, actual, now);
        let path = ingest::create_record(
            self.source.as_ref(),
            resource.kind,
            &resource.name,
            &ingest::render_record(&record)?,
        )?;
        step.resource.source_path = Some(path.display().to_string());

        if let Err(e) = resource_repo::commit_transition(&self.db, &step, &now) {
            if let Err(remove_err) = self.source.remove(&path) {
                log::error!("Failed to remove {}: {}", path.display(), remove_err);
            }
            return Err(e.into());
        }

        log::info!("Imported {} into {}", resource.identity(), path.display());
        Ok(())
    }

    /// Deletes the object from the cluster; an orphan's record is retired.
    async fn delete_from_cluster(&self, resource: &ManagedResource) -> Result<()> {
        match self
            .cluster
            .delete(resource.kind, &resource.namespace, &resource.name)
            .await
        {
            Ok(()) | Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        log::info!("Deleted {} from {}", resource.identity(), self.cluster.name());

        if resource.state == ResourceState::Orphaned {
            resource_repo::delete(&self.db, resource, "deleted from cluster", &Utc::now())?;
        }
        Ok(())
    }

    fn raise_failure(&self, alert: &Alert, action: ResolutionAction, error: &GitOpsError) -> Result<()> {
        let now = Utc::now();
        let message = format!("{} failed for alert {}: {}", action, alert.id, error);
        let resource = match alert.resource_id.as_deref() {
            Some(id) => resource_repo::find_by_id(&self.db, id)?,
            None => None,
        };
        let failure = match resource {
            Some(resource) => {
                Alert::for_resource(&resource, AlertType::SyncFailure, Severity::High, message, now)
            }
            None => Alert::new(
                &self.fabric_id,
                AlertType::SyncFailure,
                Severity::High,
                alert.subject.clone(),
                message,
                now,
            ),
        };
        self.alerts.raise(failure.with_details(json!({
            "action": action,
            "alertId": alert.id,
            "error": error.to_string(),
        })))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::alert_repo;
    use crate::gitops::alert::AlertStatus;
    use crate::gitops::cluster::InMemoryCluster;
    use crate::gitops::drift;
    use crate::gitops::resource::{ResourceIdentity, ResourceKind, SpecDocument};
    use crate::gitops::source::LocalFileTree;
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        source: Arc<LocalFileTree>,
        cluster: Arc<InMemoryCluster>,
        alerts: AlertManager,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = Database::open_in_memory().unwrap();
            Self {
                source: Arc::new(LocalFileTree::new(dir.path())),
                cluster: Arc::new(InMemoryCluster::new()),
                alerts: AlertManager::new(db.clone(), "f1"),
                db,
                _dir: dir,
            }
        }

        fn remediator(&self, timeout: Duration) -> Remediator {
            Remediator::new(
                self.db.clone(),
                "f1",
                self.source.clone(),
                self.cluster.clone(),
                4,
                timeout,
            )
        }

        fn ingested(&self, name: &str, desired: SpecDocument) -> ManagedResource {
            let identity = ResourceIdentity::new(ResourceKind::Vpc, "default", name);
            let resource = ManagedResource::ingested(
                "f1",
                &identity,
                desired,
                "c1".to_string(),
                format!("vpcs/{}.yaml", name),
                Utc::now(),
            );
            resource_repo::insert(&self.db, &resource, "ingested").unwrap();
            resource
        }

        fn pending(&self, name: &str) -> ManagedResource {
            let resource = self.ingested(name, spec(10));
            self.advance(&resource, vec![Trigger::SourceSyncObserved])
        }

        fn drifted(&self, name: &str, desired: SpecDocument, actual: SpecDocument) -> ManagedResource {
            let resource = self.ingested(name, desired.clone());
            let report = drift::detect(Some(&desired), Some(&actual)).unwrap();
            self.advance(
                &resource,
                vec![
                    Trigger::SourceSyncObserved,
                    Trigger::ObserveActual { actual: desired, status: None },
                    Trigger::ApplyConfirmed,
                    Trigger::ObserveActual { actual, status: None },
                    Trigger::DriftDetected { report },
                ],
            )
        }

        fn orphan(&self, name: &str) -> ManagedResource {
            let identity = ResourceIdentity::new(ResourceKind::Vpc, "default", name);
            self.cluster.insert(ClusterObject::new(&identity, spec(30)));
            let resource = ManagedResource::discovered("f1", &identity, spec(30), None, Utc::now());
            resource_repo::insert(&self.db, &resource, "discovered").unwrap();
            resource
        }

        fn advance(&self, resource: &ManagedResource, triggers: Vec<Trigger>) -> ManagedResource {
            let now = Utc::now();
            let steps = lifecycle::chain(resource, triggers, now).unwrap();
            resource_repo::commit_transitions(&self.db, &steps, &now).unwrap()
        }

        fn raise(&self, resource: &ManagedResource, alert_type: AlertType) -> Alert {
            let alert = Alert::for_resource(resource, alert_type, Severity::Low, "test", Utc::now());
            self.alerts.raise(alert).unwrap().alert().clone()
        }

        fn reload(&self, resource: &ManagedResource) -> Option<ManagedResource> {
            resource_repo::find_by_id(&self.db, &resource.id).unwrap()
        }
    }

    fn spec(vlan: i64) -> SpecDocument {
        SpecDocument::new().with("vlan", vlan).with("subnet", "10.0.0.0/24")
    }

    #[tokio::test]
    async fn test_update_git_writes_cluster_state_back() {
        let fx = Fixture::new();
        let resource = fx.drifted("vpc-1", spec(10), spec(20));
        let old = ingest::record_for(&resource.identity(), "f1", spec(10), Utc::now());
        fx.source
            .write(Path::new("vpcs/vpc-1.yaml"), &ingest::render_record(&old).unwrap())
            .unwrap();
        fx.alerts.evaluate_resource(&resource, Utc::now()).unwrap();
        let alert = fx.alerts.list_open(Utc::now()).unwrap().remove(0);

        let outcome = fx
            .remediator(Duration::from_secs(5))
            .execute(&alert.id, ResolutionAction::UpdateGit, "ops")
            .await
            .unwrap();
        assert!(outcome.success, "{:?}", outcome.error);

        let stored = fx.reload(&resource).unwrap();
        assert_eq!(stored.state, ResourceState::Synced);
        assert_eq!(stored.desired_spec, Some(spec(20)));
        assert!(stored.desired_commit.unwrap().starts_with("local-"));

        let bytes = fx.source.read(Path::new("vpcs/vpc-1.yaml")).unwrap();
        let record: ManagedRecord = serde_yaml::from_slice(&bytes).unwrap();
        assert_eq!(record.spec, spec(20));
        assert_eq!(record.metadata.name, "vpc-1");

        let closed = alert_repo::find_by_id(&fx.db, &alert.id).unwrap().unwrap();
        assert_eq!(closed.status, AlertStatus::Resolved);
        assert_eq!(closed.resolved_action, Some(ResolutionAction::UpdateGit));
        assert_eq!(closed.resolved_by.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn test_apply_to_cluster_confirms_pending_resource() {
        let fx = Fixture::new();
        let resource = fx.pending("vpc-1");
        let alert = fx.raise(&resource, AlertType::CreationPending);

        let outcome = fx
            .remediator(Duration::from_secs(5))
            .execute(&alert.id, ResolutionAction::ApplyToCluster, "ops")
            .await
            .unwrap();
        assert!(outcome.success, "{:?}", outcome.error);

        assert!(fx.cluster.get(&resource.identity()).is_some());
        let stored = fx.reload(&resource).unwrap();
        assert_eq!(stored.state, ResourceState::Synced);
        assert_eq!(stored.actual_spec, Some(spec(10)));
        assert!(stored.actual_status.is_some());
    }

    #[tokio::test]
    async fn test_batch_partial_failure_keeps_alert_open() {
        let fx = Fixture::new();
        let good = fx.pending("vpc-a");
        let bad = fx.pending("vpc-b");
        fx.raise(&good, AlertType::CreationPending);
        let bad_alert = fx.raise(&bad, AlertType::CreationPending);
        fx.cluster.fail_applies_for("vpc-b");

        let batches = fx.alerts.plan_batches(Utc::now()).unwrap();
        assert_eq!(batches.len(), 1);
        let result = fx
            .remediator(Duration::from_secs(5))
            .execute_batch(&batches[0], ResolutionAction::ApplyToCluster, "ops")
            .await
            .unwrap();

        assert_eq!(result.batch_id.as_deref(), Some(batches[0].id.as_str()));
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
        let failed = result.outcomes.iter().find(|o| !o.success).unwrap();
        assert_eq!(failed.alert_id, bad_alert.id);
        assert!(failed.error.as_deref().unwrap().contains("admission denied"));

        assert_eq!(fx.reload(&bad).unwrap().state, ResourceState::Pending);
        let open = alert_repo::list_for_resource(&fx.db, &bad.id).unwrap();
        assert!(open
            .iter()
            .any(|a| a.alert_type == AlertType::SyncFailure && a.is_open()));
        assert!(open.iter().any(|a| a.id == bad_alert.id && a.is_open()));
    }

    #[tokio::test]
    async fn test_batch_rejects_disallowed_action() {
        let fx = Fixture::new();
        let resource = fx.drifted("vpc-1", spec(10), spec(20));
        fx.alerts.evaluate_resource(&resource, Utc::now()).unwrap();
        let batches = fx.alerts.plan_batches(Utc::now()).unwrap();

        let err = fx
            .remediator(Duration::from_secs(5))
            .execute_batch(&batches[0], ResolutionAction::ImportToGit, "ops")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GitOpsError::Alert(AlertError::ActionNotAllowed { .. })
        ));
        assert_eq!(fx.reload(&resource).unwrap().state, ResourceState::Drifted);
    }

    #[tokio::test]
    async fn test_import_orphan_into_source_tree() {
        let fx = Fixture::new();
        let orphan = fx.orphan("stray");
        fx.alerts.evaluate_resource(&orphan, Utc::now()).unwrap();
        let alert = fx.alerts.list_open(Utc::now()).unwrap().remove(0);
        assert_eq!(alert.alert_type, AlertType::OrphanedResource);

        let outcome = fx
            .remediator(Duration::from_secs(5))
            .execute(&alert.id, ResolutionAction::ImportToGit, "ops")
            .await
            .unwrap();
        assert!(outcome.success, "{:?}", outcome.error);

        let stored = fx.reload(&orphan).unwrap();
        assert_eq!(stored.state, ResourceState::Committed);
        assert_eq!(stored.desired_spec, Some(spec(30)));
        assert_eq!(stored.source_path.as_deref(), Some("vpcs/stray.yaml"));
        assert!(fx.source.exists(Path::new("vpcs/stray.yaml")));
    }

    #[tokio::test]
    async fn test_delete_orphan_retires_record() {
        let fx = Fixture::new();
        let orphan = fx.orphan("stray");
        fx.alerts.evaluate_resource(&orphan, Utc::now()).unwrap();
        let alert = fx.alerts.list_open(Utc::now()).unwrap().remove(0);

        let outcome = fx
            .remediator(Duration::from_secs(5))
            .execute(&alert.id, ResolutionAction::DeleteFromCluster, "ops")
            .await
            .unwrap();
        assert!(outcome.success, "{:?}", outcome.error);
        assert!(fx.cluster.get(&orphan.identity()).is_none());
        assert!(fx.reload(&orphan).is_none());
        assert!(fx.alerts.list_open(Utc::now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_action_leaves_record_unchanged() {
        let fx = Fixture::new();
        let resource = fx.pending("slow");
        let alert = fx.raise(&resource, AlertType::CreationPending);
        fx.cluster.set_apply_delay(Duration::from_millis(500));

        let outcome = fx
            .remediator(Duration::from_millis(50))
            .execute(&alert.id, ResolutionAction::ApplyToCluster, "ops")
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));

        let stored = fx.reload(&resource).unwrap();
        assert_eq!(stored.version, resource.version);
        assert!(alert_repo::find_by_id(&fx.db, &alert.id).unwrap().unwrap().is_open());
    }

    #[tokio::test]
    async fn test_run_auto_updates_git_for_low_drift_only() {
        let fx = Fixture::new();
        let wide = (0..10).fold(SpecDocument::new(), |doc, i| doc.with(format!("k{}", i), i));
        let low = fx.drifted("low", wide.clone().with("vlan", 1), wide.clone().with("vlan", 2));
        let high = fx.drifted("high", spec(10), spec(20));
        fx.alerts.evaluate_resource(&low, Utc::now()).unwrap();
        fx.alerts.evaluate_resource(&high, Utc::now()).unwrap();

        let result = fx
            .remediator(Duration::from_secs(5))
            .run_auto(Utc::now())
            .await
            .unwrap();
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 0);

        assert_eq!(fx.reload(&low).unwrap().state, ResourceState::Synced);
        assert_eq!(fx.reload(&high).unwrap().state, ResourceState::Drifted);
        let closed = alert_repo::list_for_resource(&fx.db, &low.id).unwrap();
        assert_eq!(closed[0].resolved_by.as_deref(), Some(MANAGER_NAME));
    }
}
