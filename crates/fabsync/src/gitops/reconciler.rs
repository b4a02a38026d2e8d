//! Sync orchestrator: refresh → index → ingest → observe → reconcile → alert.
//!
//! One cycle brings every resource record in line with the source tree and
//! the cluster. Orchestration is sequential; the per-resource units fan out
//! on a bounded pool. A cycle requested while another one runs is skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::Instrument;

use super::alert::{Alert, AlertType, Severity};
use super::alert_manager::{AlertDelta, AlertManager};
use super::cluster::{ClusterClient, ClusterObject};
use super::drift::{self, DriftReport};
use super::error::{GitOpsError, Result};
use super::fabric::{ConnectionStatus, Fabric, SyncStatus};
use super::index::{Declared, DesiredIndex};
use super::ingest::{IngestionProcessor, IngestionResult};
use super::lifecycle::{self, Transition, TransitionError, Trigger};
use super::progress::{CyclePhase, CycleProgress, ProgressBroadcaster};
use super::remediation::Remediator;
use super::resource::{
    DriftStatus, ManagedResource, ResourceIdentity, ResourceKind, ResourceState, SpecDocument,
};
use super::source::{self, SourceTree};
use crate::config::{Config, RetryConfig};
use crate::db::{alert_repo, fabric_repo, resource_repo, Database};

/// Attempts at settling a resource whose record keeps changing underneath.
const COMMIT_ATTEMPTS: u32 = 3;
/// Upper bound on triggers applied to one resource in one cycle.
const MAX_STEPS: usize = 8;

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle_id: String,
    /// Another cycle was running; nothing was done.
    pub skipped: bool,
    pub cancelled: bool,
    /// Resources created by ingestion.
    pub ingested: usize,
    /// Resources created from desired records found in the source tree.
    pub indexed: usize,
    /// ORPHANED resources created for unknown cluster objects.
    pub discovered: usize,
    pub retired: usize,
    pub transitions: usize,
    pub alerts_created: usize,
    pub alerts_resolved: usize,
    pub remediations_succeeded: usize,
    pub remediations_failed: usize,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion: Option<IngestionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fabric: Option<Fabric>,
}

impl CycleReport {
    fn add_alerts(&mut self, delta: AlertDelta) {
        self.alerts_created += delta.created;
        self.alerts_resolved += delta.resolved;
    }
}

/// What the source tree says about one identity this cycle.
#[derive(Debug, Clone, PartialEq)]
enum Desired {
    /// The source could not be read.
    Unknown,
    Missing,
    Declared { spec: SpecDocument, path: PathBuf },
    Conflict(Vec<PathBuf>),
}

/// What the cluster says about one identity this cycle.
#[derive(Debug, Clone, PartialEq)]
enum Observed {
    /// The cluster could not be listed.
    Unknown,
    Absent,
    Present(ClusterObject),
}

struct Unit {
    identity: ResourceIdentity,
    resource: Option<ManagedResource>,
    desired: Desired,
    observed: Observed,
}

#[derive(Debug, Default)]
struct UnitOutcome {
    transitions: usize,
    indexed: bool,
    discovered: bool,
    retired: bool,
    alerts: AlertDelta,
    error: Option<String>,
}

/// Shared state of the per-resource units.
struct UnitContext {
    db: Database,
    alerts: AlertManager,
    fabric_id: String,
    commit: String,
}

pub struct SyncOrchestrator {
    db: Database,
    source: Arc<dyn SourceTree>,
    cluster: Arc<dyn ClusterClient>,
    ingestion: IngestionProcessor,
    alerts: AlertManager,
    remediator: Remediator,
    fabric_id: String,
    fabric_name: String,
    namespace: String,
    raw_dir: PathBuf,
    concurrency: usize,
    retry: RetryConfig,
    auto_remediate: bool,
    progress: ProgressBroadcaster,
    /// Held for the duration of a cycle.
    cycle_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        db: Database,
        source: Arc<dyn SourceTree>,
        cluster: Arc<dyn ClusterClient>,
        config: &Config,
        progress: ProgressBroadcaster,
    ) -> Self {
        let concurrency = config.worker_count.max(1);
        Self {
            ingestion: IngestionProcessor::new(db.clone(), Arc::clone(&source), config),
            alerts: AlertManager::new(db.clone(), config.fabric_id.clone()),
            remediator: Remediator::new(
                db.clone(),
                config.fabric_id.clone(),
                Arc::clone(&source),
                Arc::clone(&cluster),
                concurrency,
                config.action_timeout(),
            ),
            db,
            source,
            cluster,
            fabric_id: config.fabric_id.clone(),
            fabric_name: config.fabric_name().to_string(),
            namespace: config.namespace.clone(),
            raw_dir: PathBuf::from(&config.raw_directory),
            concurrency,
            retry: config.retry.clone(),
            auto_remediate: config.auto_remediate_low_drift,
            progress,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn remediator(&self) -> &Remediator {
        &self.remediator
    }

    pub fn progress(&self) -> &ProgressBroadcaster {
        &self.progress
    }

    pub fn fabric_id(&self) -> &str {
        &self.fabric_id
    }

    /// Runs one cycle with a fresh progress tracker.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let progress = self.progress.start_cycle(&self.fabric_id);
        self.run_cycle_with(&progress).await
    }

    /// Runs one cycle reporting to `progress`. Cancelling `progress` stops
    /// the cycle at the next unit boundary.
    pub async fn run_cycle_with(&self, progress: &CycleProgress) -> Result<CycleReport> {
        let _guard = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::info!("Cycle skipped: another cycle is already in progress");
                progress.finished(CyclePhase::Skipped, "Skipped: cycle already in progress");
                return Ok(CycleReport {
                    cycle_id: progress.cycle_id().to_string(),
                    skipped: true,
                    ..CycleReport::default()
                });
            }
        };

        let span = tracing::info_span!("cycle", fabric = %self.fabric_id, cycle = %progress.cycle_id());
        match self.cycle(progress).instrument(span).await {
            Ok(report) => {
                if report.cancelled {
                    progress.finished(CyclePhase::Cancelled, "Cycle cancelled");
                } else {
                    progress.completed(&format!(
                        "{} transition(s), {} alert(s) raised, {} resolved",
                        report.transitions, report.alerts_created, report.alerts_resolved
                    ));
                }
                Ok(report)
            }
            Err(e) => {
                log::error!("Cycle failed: {}", e);
                progress.failed(&e.to_string());
                Err(e)
            }
        }
    }

    async fn cycle(&self, progress: &CycleProgress) -> Result<CycleReport> {
        let started = Utc::now();
        let mut report = CycleReport {
            cycle_id: progress.cycle_id().to_string(),
            ..CycleReport::default()
        };
        progress.phase(CyclePhase::Starting);
        self.mark_syncing(started)?;

        // 1. source + desired index
        progress.phase(CyclePhase::RefreshingSource);
        let source_ok = self.refresh_source(&mut report).await?;
        let mut index = None;
        if source_ok {
            progress.phase(CyclePhase::Indexing);
            match DesiredIndex::build(self.source.as_ref(), &self.namespace) {
                Ok(built) => {
                    report.add_alerts(self.sync_record_alerts(&built, started)?);
                    index = Some(built);
                }
                Err(e) => {
                    log::error!("Failed to index desired records: {}", e);
                    report.errors.push(format!("index: {}", e));
                }
            }
        }

        // 2. ingestion
        if let Some(index) = index.as_mut() {
            progress.phase(CyclePhase::Ingesting);
            match self.ingestion.run(&self.raw_dir, started) {
                Ok(result) => {
                    index.merge_written(&result.records);
                    report.ingested = result.created_resources.len();
                    report.alerts_created += result.alerts_raised;
                    report
                        .errors
                        .extend(result.errors.iter().map(|e| format!("ingest: {}", e)));
                    report.ingestion = Some(result);
                }
                Err(e @ GitOpsError::Database(_)) => return Err(e),
                Err(e) => {
                    log::error!("Ingestion failed: {}", e);
                    report.errors.push(format!("ingest: {}", e));
                }
            }
        }
        if self.stop_requested(progress, &mut report) {
            return self.finish(report, source_ok, true);
        }

        // 3. cluster observation
        progress.phase(CyclePhase::ObservingCluster);
        let resources = resource_repo::list_by_fabric(&self.db, &self.fabric_id)?;
        let mut namespaces: BTreeSet<String> =
            resources.iter().map(|r| r.namespace.clone()).collect();
        namespaces.insert(self.namespace.clone());
        if let Some(index) = &index {
            namespaces.extend(index.namespaces());
        }
        let observed = self.observe_cluster(&namespaces, &mut report).await?;
        let cluster_ok = observed.is_some();
        if self.stop_requested(progress, &mut report) {
            return self.finish(report, source_ok, cluster_ok);
        }

        // 4 + 5. per-resource units
        progress.phase(CyclePhase::Reconciling);
        let units = build_units(resources, index.as_ref(), observed.as_ref());
        self.run_units(units, progress, started, &mut report).await;
        if report.cancelled {
            return self.finish(report, source_ok, cluster_ok);
        }

        // 6. alerts and auto-remediation
        progress.phase(CyclePhase::Alerting);
        report.add_alerts(self.alerts.repair(started)?);

        if self.auto_remediate && !self.stop_requested(progress, &mut report) {
            progress.phase(CyclePhase::Remediating);
            let result = self.remediator.run_auto(Utc::now()).await?;
            report.remediations_succeeded += result.succeeded;
            report.remediations_failed += result.failed;
        }

        progress.phase(CyclePhase::RecomputingFabric);
        self.finish(report, source_ok, cluster_ok)
    }

    fn stop_requested(&self, progress: &CycleProgress, report: &mut CycleReport) -> bool {
        if progress.is_cancelled() {
            report.cancelled = true;
        }
        report.cancelled
    }

    /// 7. fabric aggregate
    fn finish(&self, mut report: CycleReport, source_ok: bool, cluster_ok: bool) -> Result<CycleReport> {
        let now = Utc::now();
        let (status, error) = if source_ok && cluster_ok {
            (ConnectionStatus::Connected, None)
        } else {
            (ConnectionStatus::Failed, report.errors.last().map(String::as_str))
        };
        fabric_repo::set_connection_status(&self.db, &self.fabric_id, status, error, now)?;
        let fabric = fabric_repo::recompute(&self.db, &self.fabric_id, now)?;

        log::info!(
            "Cycle finished: fabric {} is {} ({} transition(s), {} alert(s) raised, {} resolved, {} error(s))",
            self.fabric_id,
            fabric.sync_status.as_str(),
            report.transitions,
            report.alerts_created,
            report.alerts_resolved,
            report.errors.len()
        );
        report.fabric = Some(fabric);
        Ok(report)
    }

    fn mark_syncing(&self, now: DateTime<Utc>) -> Result<()> {
        let mut fabric = fabric_repo::ensure(&self.db, &self.fabric_id, &self.fabric_name, now)?;
        fabric.sync_status = SyncStatus::Syncing;
        fabric.updated_at = now;
        fabric_repo::save(&self.db, &fabric)?;
        Ok(())
    }

    async fn refresh_source(&self, report: &mut CycleReport) -> Result<bool> {
        let source = &self.source;
        let refreshed = self
            .with_retry(source.name(), move || async move {
                source.refresh().map_err(GitOpsError::from)
            })
            .await;
        self.connectivity(source.name(), refreshed, report)
            .map(|r| r.is_some())
    }

    /// Lists every kind in every namespace. `None` when the cluster could
    /// not be listed completely.
    async fn observe_cluster(
        &self,
        namespaces: &BTreeSet<String>,
        report: &mut CycleReport,
    ) -> Result<Option<BTreeMap<ResourceIdentity, ClusterObject>>> {
        let cluster = &self.cluster;
        let listed = async {
            let mut objects = BTreeMap::new();
            for &kind in ResourceKind::all() {
                for namespace in namespaces {
                    let namespace = namespace.as_str();
                    let listed = self
                        .with_retry(cluster.name(), move || async move {
                            cluster.list(kind, namespace).await.map_err(GitOpsError::from)
                        })
                        .await?;
                    for object in listed {
                        objects.insert(object.identity(), object);
                    }
                }
            }
            Ok::<_, GitOpsError>(objects)
        }
        .await;
        self.connectivity(cluster.name(), listed, report)
    }

    /// Turns the outcome of a collaborator call into alerts: a failure
    /// raises one sync_failure for the collaborator, success clears it.
    fn connectivity<T>(
        &self,
        name: &str,
        outcome: Result<T>,
        report: &mut CycleReport,
    ) -> Result<Option<T>> {
        let now = Utc::now();
        match outcome {
            Ok(value) => {
                if self.alerts.clear(AlertType::SyncFailure, None, name, now)? {
                    report.alerts_resolved += 1;
                }
                Ok(Some(value))
            }
            Err(e @ GitOpsError::Database(_)) => Err(e),
            Err(e) => {
                log::error!("{} unavailable: {}", name, e);
                report.errors.push(format!("{}: {}", name, e));
                let alert = Alert::new(
                    &self.fabric_id,
                    AlertType::SyncFailure,
                    Severity::High,
                    name,
                    format!("{} unavailable: {}", name, e),
                    now,
                )
                .with_details(json!({ "error": e.to_string() }));
                if self.alerts.raise(alert)?.is_created() {
                    report.alerts_created += 1;
                }
                Ok(None)
            }
        }
    }

    /// Runs `op`, retrying retryable failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "{} failed with retryable error: {} (retry {}/{} in {:?})",
                        what,
                        e,
                        attempt,
                        self.retry.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Raises validation alerts for unreadable records in the managed
    /// directories and clears those whose record became readable again.
    fn sync_record_alerts(&self, index: &DesiredIndex, now: DateTime<Utc>) -> Result<AlertDelta> {
        let mut delta = AlertDelta::default();
        let mut unreadable = BTreeSet::new();
        for record in index.unreadable() {
            let subject = record.path.display().to_string();
            let alert = Alert::new(
                &self.fabric_id,
                AlertType::ValidationError,
                Severity::High,
                subject.clone(),
                format!("{} is not a valid managed record: {}", subject, record.message),
                now,
            )
            .with_details(json!({ "file": subject, "error": record.message }));
            delta.count(&self.alerts.raise(alert)?);
            unreadable.insert(subject);
        }

        for alert in alert_repo::list_open(&self.db, &self.fabric_id)? {
            let stale = alert.alert_type == AlertType::ValidationError
                && alert.resource_id.is_none()
                && in_managed_directory(&alert.subject)
                && !unreadable.contains(&alert.subject);
            if stale && self.alerts.clear(AlertType::ValidationError, None, &alert.subject, now)? {
                delta.resolved += 1;
            }
        }
        Ok(delta)
    }

    async fn run_units(
        &self,
        units: Vec<Unit>,
        progress: &CycleProgress,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let total = units.len() as u64;
        if total == 0 {
            return;
        }
        log::debug!("Reconciling {} resource unit(s)", total);

        let ctx = Arc::new(UnitContext {
            db: self.db.clone(),
            alerts: self.alerts.clone(),
            fabric_id: self.fabric_id.clone(),
            commit: source::commit_id(self.source.as_ref(), now),
        });
        let cancelled: Arc<AtomicBool> = progress.cancellation_token();

        let mut outcomes = stream::iter(units)
            .map(|unit| {
                let ctx = Arc::clone(&ctx);
                let cancelled = Arc::clone(&cancelled);
                async move {
                    if cancelled.load(Ordering::Acquire) {
                        return None;
                    }
                    let identity = unit.identity.to_string();
                    let outcome = tokio::task::spawn_blocking(move || reconcile_unit(&ctx, unit, now))
                        .await
                        .unwrap_or_else(|e| UnitOutcome {
                            error: Some(format!("{}: {}", identity, GitOpsError::Join(e.to_string()))),
                            ..UnitOutcome::default()
                        });
                    Some(outcome)
                }
            })
            .buffer_unordered(self.concurrency);

        let mut done = 0;
        while let Some(outcome) = outcomes.next().await {
            let Some(outcome) = outcome else {
                report.cancelled = true;
                continue;
            };
            done += 1;
            progress.units(done, total);

            report.transitions += outcome.transitions;
            report.indexed += usize::from(outcome.indexed);
            report.discovered += usize::from(outcome.discovered);
            report.retired += usize::from(outcome.retired);
            report.add_alerts(outcome.alerts);
            if let Some(error) = outcome.error {
                log::error!("Reconciling {}", error);
                report.errors.push(error);
            }
        }
        if report.cancelled {
            log::info!("Cycle cancelled after {}/{} resource unit(s)", done, total);
        }
    }
}

fn in_managed_directory(subject: &str) -> bool {
    subject
        .split('/')
        .next()
        .and_then(ResourceKind::from_directory)
        .is_some()
}

/// Pairs every known identity with its record, desired and observed state.
fn build_units(
    resources: Vec<ManagedResource>,
    index: Option<&DesiredIndex>,
    observed: Option<&BTreeMap<ResourceIdentity, ClusterObject>>,
) -> Vec<Unit> {
    let mut records: BTreeMap<ResourceIdentity, ManagedResource> =
        resources.into_iter().map(|r| (r.identity(), r)).collect();

    let mut identities: BTreeSet<ResourceIdentity> = records.keys().cloned().collect();
    if let Some(index) = index {
        identities.extend(index.identities().cloned());
    }
    if let Some(observed) = observed {
        identities.extend(observed.keys().cloned());
    }

    identities
        .into_iter()
        .map(|identity| {
            let desired = match index.map(|i| i.lookup(&identity)) {
                None => Desired::Unknown,
                Some(Declared::Missing) => Desired::Missing,
                Some(Declared::Unique(entry)) => Desired::Declared {
                    spec: entry.spec.clone(),
                    path: entry.path.clone(),
                },
                Some(Declared::Conflict(paths)) => {
                    Desired::Conflict(paths.into_iter().map(PathBuf::from).collect())
                }
            };
            let observed = match observed {
                None => Observed::Unknown,
                Some(objects) => match objects.get(&identity) {
                    Some(object) => Observed::Present(object.clone()),
                    None => Observed::Absent,
                },
            };
            Unit {
                resource: records.remove(&identity),
                identity,
                desired,
                observed,
            }
        })
        .collect()
}

fn reconcile_unit(ctx: &UnitContext, unit: Unit, now: DateTime<Utc>) -> UnitOutcome {
    let _span = tracing::debug_span!("unit", resource = %unit.identity).entered();
    let identity = unit.identity.to_string();
    let mut outcome = UnitOutcome::default();
    if let Err(e) = settle_unit(ctx, unit, now, &mut outcome) {
        outcome.error = Some(format!("{}: {}", identity, e));
    }
    outcome
}

enum Settled {
    Saved(ManagedResource),
    Retired,
}

fn settle_unit(
    ctx: &UnitContext,
    unit: Unit,
    now: DateTime<Utc>,
    outcome: &mut UnitOutcome,
) -> Result<()> {
    let Unit {
        identity,
        resource,
        desired,
        observed,
    } = unit;

    track_conflict(ctx, &identity, resource.as_ref(), &desired, now, outcome)?;

    let mut current = match resource {
        Some(resource) => resource,
        None => match (&desired, &observed) {
            (Desired::Declared { spec, path }, _) => {
                let created = ManagedResource::ingested(
                    &ctx.fabric_id,
                    &identity,
                    spec.clone(),
                    ctx.commit.clone(),
                    path.display().to_string(),
                    now,
                );
                resource_repo::insert(&ctx.db, &created, "indexed")?;
                log::info!("Tracking {} from {}", identity, path.display());
                outcome.indexed = true;
                created
            }
            (Desired::Missing, Observed::Present(object)) => {
                let orphan = ManagedResource::discovered(
                    &ctx.fabric_id,
                    &identity,
                    object.spec.clone(),
                    object.status.clone(),
                    now,
                );
                resource_repo::insert(&ctx.db, &orphan, "discovered")?;
                log::warn!("Discovered {} in the cluster without a desired record", identity);
                outcome.discovered = true;
                outcome.alerts.merge(ctx.alerts.evaluate_resource(&orphan, now)?);
                return Ok(());
            }
            _ => return Ok(()),
        },
    };

    let mut attempt = 0;
    let settled = loop {
        attempt += 1;
        match settle_once(ctx, &current, &desired, &observed, now) {
            Ok((settled, steps)) => {
                outcome.transitions += steps;
                break settled;
            }
            Err(GitOpsError::Database(e)) if e.is_conflict() && attempt < COMMIT_ATTEMPTS => {
                log::debug!("Record of {} changed concurrently, reloading", identity);
                match resource_repo::find_by_id(&ctx.db, &current.id)? {
                    Some(reloaded) => current = reloaded,
                    None => return Ok(()),
                }
            }
            Err(GitOpsError::Database(e)) if e.is_conflict() => {
                return Err(GitOpsError::Contention(identity.to_string()));
            }
            Err(e) => return Err(e),
        }
    };

    match settled {
        Settled::Retired => {
            outcome.retired = true;
            outcome.alerts.resolved +=
                ctx.alerts
                    .resolve_for_resource(&current.id, AlertType::all(), now)?;
        }
        Settled::Saved(resource) => {
            outcome.alerts.merge(ctx.alerts.evaluate_resource(&resource, now)?);
        }
    }
    Ok(())
}

/// Applies the triggers `current` needs and persists them in one
/// transaction. Returns the settled record and the number of steps.
fn settle_once(
    ctx: &UnitContext,
    current: &ManagedResource,
    desired: &Desired,
    observed: &Observed,
    now: DateTime<Utc>,
) -> Result<(Settled, usize)> {
    if let Some(reason) = retire_reason(current, desired, observed) {
        resource_repo::delete(&ctx.db, current, reason, &now)?;
        log::info!("Retired {}: {}", current.identity(), reason);
        return Ok((Settled::Retired, 0));
    }

    let mut steps = plan(current, desired, observed, &ctx.commit, now)?;
    let path = match desired {
        Desired::Declared { path, .. } => Some(path.display().to_string()),
        _ => None,
    };

    let Some(last) = steps.last_mut() else {
        if path.is_some() && path != current.source_path {
            let moved = resource_repo::set_source_path(&ctx.db, current, path.as_deref())?;
            return Ok((Settled::Saved(moved), 0));
        }
        return Ok((Settled::Saved(current.clone()), 0));
    };
    if path.is_some() {
        last.resource.source_path = path;
    }

    let saved = resource_repo::commit_transitions(&ctx.db, &steps, &now)?;
    for step in steps.iter().filter(|s| s.changes_state()) {
        log::info!("{}: {} -> {} ({})", saved.identity(), step.from, step.to, step.reason);
    }
    Ok((Settled::Saved(saved), steps.len()))
}

/// Raises or clears the conflict alert for an identity claimed by several
/// desired records.
fn track_conflict(
    ctx: &UnitContext,
    identity: &ResourceIdentity,
    resource: Option<&ManagedResource>,
    desired: &Desired,
    now: DateTime<Utc>,
    outcome: &mut UnitOutcome,
) -> Result<()> {
    let subject = identity.to_string();
    match desired {
        Desired::Conflict(paths) => {
            let message = format!("{} is declared by {} records", identity, paths.len());
            let alert = match resource {
                Some(r) => Alert::for_resource(r, AlertType::ConflictDetected, Severity::Critical, message, now),
                None => Alert::new(
                    &ctx.fabric_id,
                    AlertType::ConflictDetected,
                    Severity::Critical,
                    subject,
                    message,
                    now,
                ),
            }
            .with_details(json!({ "paths": paths }));
            outcome.alerts.count(&ctx.alerts.raise(alert)?);
        }
        Desired::Unknown => {}
        Desired::Missing | Desired::Declared { .. } => {
            let resource_id = resource.map(|r| r.id.as_str());
            if ctx
                .alerts
                .clear(AlertType::ConflictDetected, resource_id, &subject, now)?
            {
                outcome.alerts.resolved += 1;
            }
        }
    }
    Ok(())
}

/// Why a record should be deleted, if it should.
fn retire_reason(
    resource: &ManagedResource,
    desired: &Desired,
    observed: &Observed,
) -> Option<&'static str> {
    match (resource.state, desired, observed) {
        (ResourceState::Draft, _, _) => None,
        (_, Desired::Declared { .. } | Desired::Conflict(_), _) => None,
        (ResourceState::Orphaned, _, Observed::Absent) => Some("no longer present in the cluster"),
        (ResourceState::Orphaned, _, _) => None,
        (_, Desired::Missing, Observed::Absent) => Some("removed from the source tree and the cluster"),
        (_, Desired::Missing, Observed::Unknown) if resource.actual_spec.is_none() => {
            Some("removed from the source tree before it was applied")
        }
        _ => None,
    }
}

/// Computes the trigger chain that brings `resource` in line with this
/// cycle's observations.
fn plan(
    resource: &ManagedResource,
    desired: &Desired,
    observed: &Observed,
    commit: &str,
    now: DateTime<Utc>,
) -> std::result::Result<Vec<Transition>, TransitionError> {
    let mut steps: Vec<Transition> = Vec::new();
    while steps.len() < MAX_STEPS {
        let current = steps.last().map(|s| &s.resource).unwrap_or(resource);
        let Some(trigger) = next_trigger(current, desired, observed, commit) else {
            return Ok(steps);
        };
        steps.push(lifecycle::transition(current, trigger, now)?);
    }
    log::warn!("{} did not settle within {} steps", resource.identity(), MAX_STEPS);
    Ok(steps)
}

/// The next trigger `resource` needs, or `None` once it is settled.
fn next_trigger(
    resource: &ManagedResource,
    desired: &Desired,
    observed: &Observed,
    commit: &str,
) -> Option<Trigger> {
    if let Observed::Present(object) = observed {
        if resource.actual_spec.as_ref() != Some(&object.spec) || resource.actual_status != object.status {
            return Some(Trigger::ObserveActual {
                actual: object.spec.clone(),
                status: object.status.clone(),
            });
        }
    }
    if resource.state == ResourceState::Draft {
        return None;
    }

    match desired {
        Desired::Declared { spec, .. } => {
            if resource.state == ResourceState::Orphaned {
                return Some(Trigger::Import {
                    commit: commit.to_string(),
                });
            }
            if resource.desired_spec.as_ref() != Some(spec) {
                return Some(Trigger::DesiredChanged {
                    desired: spec.clone(),
                    commit: commit.to_string(),
                });
            }
        }
        Desired::Missing => {
            if resource.state != ResourceState::Orphaned && resource.actual_spec.is_some() {
                return Some(Trigger::OrphanDetected);
            }
        }
        Desired::Unknown | Desired::Conflict(_) => {}
    }

    match resource.state {
        ResourceState::Committed if matches!(desired, Desired::Declared { .. }) => {
            Some(Trigger::SourceSyncObserved)
        }
        ResourceState::Pending => match observed {
            Observed::Present(_) => Some(Trigger::ApplyConfirmed),
            Observed::Absent if resource.drift_status != DriftStatus::CreationPending => {
                creation_pending(resource).map(|report| Trigger::RecordDrift { report })
            }
            _ => None,
        },
        ResourceState::Synced | ResourceState::Drifted => {
            let actual = match observed {
                Observed::Present(object) => Some(&object.spec),
                Observed::Absent => None,
                Observed::Unknown => return None,
            };
            let report = drift::detect(resource.desired_spec.as_ref(), actual)?;
            match (resource.state, report.has_drift()) {
                (ResourceState::Synced, true) => Some(Trigger::DriftDetected { report }),
                (ResourceState::Drifted, false) => Some(Trigger::ReconciliationConfirmed {
                    desired: None,
                    commit: None,
                }),
                (ResourceState::Drifted, true) if !drift_matches(resource, &report) => {
                    Some(Trigger::RecordDrift { report })
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn creation_pending(resource: &ManagedResource) -> Option<DriftReport> {
    drift::detect(resource.desired_spec.as_ref(), None).map(|report| DriftReport {
        status: DriftStatus::CreationPending,
        ..report
    })
}

fn drift_matches(resource: &ManagedResource, report: &DriftReport) -> bool {
    resource.drift_score == report.score
        && resource.drift_status == report.status
        && resource.drift_details.as_ref() == Some(&report.details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::cluster::InMemoryCluster;
    use crate::gitops::source::LocalFileTree;
    use std::fs;
    use tempfile::TempDir;

    fn identity(name: &str) -> ResourceIdentity {
        ResourceIdentity::new(ResourceKind::Vpc, "default", name)
    }

    fn spec(vlan: i64) -> SpecDocument {
        SpecDocument::new().with("vlan", vlan)
    }

    fn declared(vlan: i64) -> Desired {
        Desired::Declared {
            spec: spec(vlan),
            path: PathBuf::from("vpcs/vpc-1.yaml"),
        }
    }

    fn present(vlan: i64) -> Observed {
        Observed::Present(ClusterObject::new(&identity("vpc-1"), spec(vlan)))
    }

    fn settle(resource: &ManagedResource, desired: &Desired, observed: &Observed) -> ManagedResource {
        let steps = plan(resource, desired, observed, "c2", Utc::now()).unwrap();
        steps.last().map(|s| s.resource.clone()).unwrap_or_else(|| resource.clone())
    }

    fn committed() -> ManagedResource {
        ManagedResource::ingested(
            "f1",
            &identity("vpc-1"),
            spec(10),
            "c1".to_string(),
            "vpcs/vpc-1.yaml".to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn test_committed_resource_settles_to_synced_when_cluster_matches() {
        let settled = settle(&committed(), &declared(10), &present(10));
        assert_eq!(settled.state, ResourceState::Synced);
        assert_eq!(settled.drift_status, DriftStatus::InSync);
        assert!(plan(&settled, &declared(10), &present(10), "c2", Utc::now())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_cluster_difference_drifts_and_heals() {
        let drifted = settle(&committed(), &declared(10), &present(20));
        assert_eq!(drifted.state, ResourceState::Drifted);
        assert_eq!(drifted.drift_score, 1.0);

        let healed = settle(&drifted, &declared(10), &present(10));
        assert_eq!(healed.state, ResourceState::Synced);
        assert!(healed.drift_details.is_none());
    }

    #[test]
    fn test_missing_cluster_object_marks_creation_pending() {
        let pending = settle(&committed(), &declared(10), &Observed::Absent);
        assert_eq!(pending.state, ResourceState::Pending);
        assert_eq!(pending.drift_status, DriftStatus::CreationPending);
        assert!(plan(&pending, &declared(10), &Observed::Absent, "c2", Utc::now())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_removed_record_orphans_applied_resource() {
        let synced = settle(&committed(), &declared(10), &present(10));
        let orphan = settle(&synced, &Desired::Missing, &present(10));
        assert_eq!(orphan.state, ResourceState::Orphaned);
        assert!(orphan.desired_spec.is_none());

        assert_eq!(
            retire_reason(&orphan, &Desired::Missing, &Observed::Absent),
            Some("no longer present in the cluster")
        );
        assert_eq!(retire_reason(&orphan, &Desired::Missing, &Observed::Unknown), None);
    }

    #[test]
    fn test_redeclared_orphan_is_imported_with_new_spec() {
        let orphan = ManagedResource::discovered("f1", &identity("vpc-1"), spec(10), None, Utc::now());
        let adopted = settle(&orphan, &declared(20), &present(10));
        assert_eq!(adopted.desired_spec, Some(spec(20)));
        assert_eq!(adopted.state, ResourceState::Drifted);
    }

    #[test]
    fn test_unknown_sides_change_nothing() {
        let synced = settle(&committed(), &declared(10), &present(10));
        assert!(plan(&synced, &Desired::Unknown, &Observed::Unknown, "c2", Utc::now())
            .unwrap()
            .is_empty());
        assert_eq!(retire_reason(&synced, &Desired::Unknown, &Observed::Unknown), None);
        assert!(plan(&synced, &Desired::Conflict(vec![]), &present(10), "c2", Utc::now())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unapplied_record_removed_from_source_is_retired() {
        let resource = committed();
        assert!(retire_reason(&resource, &Desired::Missing, &Observed::Unknown).is_some());
        assert!(retire_reason(&resource, &Desired::Missing, &Observed::Absent).is_some());
        assert!(retire_reason(&resource, &declared(10), &Observed::Absent).is_none());
    }

    #[test]
    fn test_build_units_pairs_all_sides() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("vpcs")).unwrap();
        fs::write(
            dir.path().join("vpcs/vpc-1.yaml"),
            "kind: VPC\nmetadata:\n  name: vpc-1\nspec:\n  vlan: 10\n",
        )
        .unwrap();
        let index = DesiredIndex::build(&LocalFileTree::new(dir.path()), "default").unwrap();
        let observed = BTreeMap::from([(
            identity("stray"),
            ClusterObject::new(&identity("stray"), spec(1)),
        )]);

        let units = build_units(vec![committed()], Some(&index), Some(&observed));
        assert_eq!(units.len(), 2);
        let stray = units.iter().find(|u| u.identity == identity("stray")).unwrap();
        assert!(stray.resource.is_none());
        assert_eq!(stray.desired, Desired::Missing);
        let vpc = units.iter().find(|u| u.identity == identity("vpc-1")).unwrap();
        assert!(vpc.resource.is_some());
        assert_eq!(vpc.observed, Observed::Absent);
        assert!(matches!(vpc.desired, Desired::Declared { .. }));

        let blind = build_units(vec![committed()], None, None);
        assert_eq!(blind[0].desired, Desired::Unknown);
        assert_eq!(blind[0].observed, Observed::Unknown);
    }

    #[tokio::test]
    async fn test_concurrent_cycle_is_skipped() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let config = Config::new("f1", &dir.path().display().to_string());
        let orchestrator = SyncOrchestrator::new(
            db,
            Arc::new(LocalFileTree::new(dir.path())),
            Arc::new(InMemoryCluster::new()),
            &config,
            ProgressBroadcaster::default(),
        );

        let _held = orchestrator.cycle_lock.try_lock().unwrap();
        let report = orchestrator.run_cycle().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.transitions, 0);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_raises_one_failure_alert() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::new("f1", &dir.path().display().to_string());
        config.retry = RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let cluster = Arc::new(InMemoryCluster::new());
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            Arc::new(LocalFileTree::new(dir.path())),
            cluster.clone(),
            &config,
            ProgressBroadcaster::default(),
        );

        cluster.fail_next_calls(2);
        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.alerts_created, 1);
        let fabric = report.fabric.unwrap();
        assert_eq!(fabric.connection_status, ConnectionStatus::Failed);
        assert_eq!(fabric.sync_status, SyncStatus::Error);

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.alerts_resolved, 1);
        assert_eq!(report.fabric.unwrap().connection_status, ConnectionStatus::Connected);
    }
}
