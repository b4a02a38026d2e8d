//! Six-state resource lifecycle.
//!
//! [`transition`] is the single place that decides whether a trigger may
//! fire and what it does to a resource. It is pure: callers persist the
//! returned [`Transition`] through `db::resource_repo::commit_transition`,
//! which writes the new record and the history row in one transaction.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

use super::drift::{self, DriftReport};
use super::resource::{DriftStatus, ManagedResource, ResourceState, SpecDocument};

use ResourceState::*;

/// Directed edges of the lifecycle graph, with the trigger that walks them.
const EDGES: &[(ResourceState, ResourceState, &str)] = &[
    (Draft, Committed, "commit"),
    (Committed, Pending, "source_sync_observed"),
    (Pending, Synced, "apply_confirmed"),
    (Synced, Drifted, "drift_detected"),
    (Drifted, Synced, "reconciliation_confirmed"),
    (Synced, Pending, "desired_changed"),
    (Orphaned, Committed, "import"),
    (Orphaned, Draft, "begin_editing"),
    (Draft, Orphaned, "orphan_detected"),
    (Committed, Orphaned, "orphan_detected"),
    (Pending, Orphaned, "orphan_detected"),
    (Synced, Orphaned, "orphan_detected"),
    (Drifted, Orphaned, "orphan_detected"),
];

/// Something that happened to a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Operator committed the draft.
    Commit { commit: String },
    /// The committed record was observed in the source tree.
    SourceSyncObserved,
    /// The cluster reports the resource after an apply.
    ApplyConfirmed,
    /// The detector found drift on a synced resource.
    DriftDetected { report: DriftReport },
    /// Drift is gone. `desired` is set when the source was updated to match.
    ReconciliationConfirmed {
        desired: Option<SpecDocument>,
        commit: Option<String>,
    },
    /// The source tree declares a different desired spec.
    DesiredChanged { desired: SpecDocument, commit: String },
    /// An orphan is adopted: its actual spec becomes the desired spec.
    Import { commit: String },
    /// An orphan is copied into a draft for editing.
    BeginEditing,
    /// The resource exists in the cluster but no longer in the source tree.
    OrphanDetected,
    /// Replace the draft spec.
    EditDraft { draft: SpecDocument },
    /// Refresh the observed cluster state.
    ObserveActual {
        actual: SpecDocument,
        status: Option<Value>,
    },
    /// Refresh stored drift fields without changing state.
    RecordDrift { report: DriftReport },
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Commit { .. } => "commit",
            Trigger::SourceSyncObserved => "source_sync_observed",
            Trigger::ApplyConfirmed => "apply_confirmed",
            Trigger::DriftDetected { .. } => "drift_detected",
            Trigger::ReconciliationConfirmed { .. } => "reconciliation_confirmed",
            Trigger::DesiredChanged { .. } => "desired_changed",
            Trigger::Import { .. } => "import",
            Trigger::BeginEditing => "begin_editing",
            Trigger::OrphanDetected => "orphan_detected",
            Trigger::EditDraft { .. } => "edit_draft",
            Trigger::ObserveActual { .. } => "observe_actual",
            Trigger::RecordDrift { .. } => "record_drift",
        }
    }

    /// Target state for `from`, or `None` if the trigger cannot fire there.
    fn target(&self, from: ResourceState) -> Option<ResourceState> {
        match (self, from) {
            (Trigger::Commit { .. }, Draft) => Some(Committed),
            (Trigger::SourceSyncObserved, Committed) => Some(Pending),
            (Trigger::ApplyConfirmed, Pending) => Some(Synced),
            (Trigger::DriftDetected { .. }, Synced) => Some(Drifted),
            (Trigger::ReconciliationConfirmed { .. }, Drifted) => Some(Synced),
            (Trigger::DesiredChanged { .. }, Synced) => Some(Pending),
            (Trigger::DesiredChanged { .. }, Committed | Pending | Drifted) => Some(from),
            (Trigger::Import { .. }, Orphaned) => Some(Committed),
            (Trigger::BeginEditing, Orphaned) => Some(Draft),
            (Trigger::OrphanDetected, s) if s != Orphaned => Some(Orphaned),
            (Trigger::EditDraft { .. }, Draft) => Some(Draft),
            (Trigger::ObserveActual { .. }, s) => Some(s),
            (Trigger::RecordDrift { .. }, s) if s != Draft => Some(s),
            _ => None,
        }
    }

    /// The state this trigger normally leads to, used in rejection messages.
    fn nominal_target(&self, from: ResourceState) -> ResourceState {
        match self {
            Trigger::Commit { .. } | Trigger::Import { .. } => Committed,
            Trigger::SourceSyncObserved | Trigger::DesiredChanged { .. } => Pending,
            Trigger::ApplyConfirmed | Trigger::ReconciliationConfirmed { .. } => Synced,
            Trigger::DriftDetected { .. } => Drifted,
            Trigger::BeginEditing | Trigger::EditDraft { .. } => Draft,
            Trigger::OrphanDetected => Orphaned,
            Trigger::ObserveActual { .. } | Trigger::RecordDrift { .. } => from,
        }
    }
}

/// Why a trigger was refused. The resource is never modified on rejection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("invalid transition {from} -> {to} ({trigger}); {}", describe_path(.suggested_path))]
    Invalid {
        from: ResourceState,
        to: ResourceState,
        trigger: &'static str,
        suggested_path: Option<Vec<ResourceState>>,
    },

    #[error("cannot apply {trigger} to {from} resource: {reason}")]
    PreconditionFailed {
        from: ResourceState,
        trigger: &'static str,
        reason: String,
    },
}

fn describe_path(path: &Option<Vec<ResourceState>>) -> String {
    match path {
        Some(states) => {
            let rendered: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
            format!("valid path: {}", rendered.join(" -> "))
        }
        None => "no valid path exists".to_string(),
    }
}

/// A computed, not yet persisted, change to a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: ResourceState,
    pub to: ResourceState,
    pub trigger: &'static str,
    pub reason: String,
    pub resource: ManagedResource,
}

impl Transition {
    pub fn changes_state(&self) -> bool {
        self.from != self.to
    }
}

/// Shortest valid path from `from` to `to` through the lifecycle graph,
/// including both endpoints.
pub fn shortest_path(from: ResourceState, to: ResourceState) -> Option<Vec<ResourceState>> {
    if from == to {
        return Some(vec![from]);
    }

    let mut previous: HashMap<ResourceState, ResourceState> = HashMap::new();
    let mut queue = VecDeque::from([from]);

    while let Some(current) = queue.pop_front() {
        for &(edge_from, edge_to, _) in EDGES {
            if edge_from != current || edge_to == from || previous.contains_key(&edge_to) {
                continue;
            }
            previous.insert(edge_to, current);
            if edge_to == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&prev) = previous.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(edge_to);
        }
    }

    None
}

/// Returns true when the lifecycle graph has a direct edge `from -> to`.
pub fn is_direct_edge(from: ResourceState, to: ResourceState) -> bool {
    EDGES.iter().any(|&(f, t, _)| f == from && t == to)
}

/// Rejects a requested state change that has no direct edge.
pub fn check_edge(from: ResourceState, to: ResourceState) -> Result<(), TransitionError> {
    if is_direct_edge(from, to) {
        return Ok(());
    }
    Err(TransitionError::Invalid {
        from,
        to,
        trigger: "requested",
        suggested_path: shortest_path(from, to),
    })
}

/// Applies `trigger` to `resource`, returning the resulting record.
pub fn transition(
    resource: &ManagedResource,
    trigger: Trigger,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    let from = resource.state;
    let trigger_name = trigger.name();

    let Some(to) = trigger.target(from) else {
        let to = trigger.nominal_target(from);
        return Err(TransitionError::Invalid {
            from,
            to,
            trigger: trigger_name,
            suggested_path: shortest_path(from, to),
        });
    };

    let fail = |reason: String| TransitionError::PreconditionFailed {
        from,
        trigger: trigger_name,
        reason,
    };

    let mut next = resource.clone();
    let reason: String;

    match trigger {
        Trigger::Commit { commit } => {
            let draft = next
                .draft_spec
                .take()
                .ok_or_else(|| fail("draft spec is not set".to_string()))?;
            next.desired_spec = Some(draft);
            next.desired_commit = Some(commit.clone());
            next.desired_updated = Some(now);
            refresh_drift(&mut next, to);
            reason = format!("committed at {}", commit);
        }
        Trigger::SourceSyncObserved => {
            if next.desired_spec.is_none() {
                return Err(fail("desired spec is not set".to_string()));
            }
            next.desired_updated = Some(now);
            reason = "record observed in source tree".to_string();
        }
        Trigger::ApplyConfirmed => {
            if next.actual_spec.is_none() {
                return Err(fail("actual spec has not been observed".to_string()));
            }
            refresh_drift(&mut next, to);
            reason = "apply confirmed by cluster".to_string();
        }
        Trigger::DriftDetected { report } => {
            if !report.has_drift() {
                return Err(fail("drift score is zero".to_string()));
            }
            reason = format!("drift detected (score {:.2})", report.score);
            store_report(&mut next, report, to);
        }
        Trigger::ReconciliationConfirmed { desired, commit } => {
            if let Some(desired) = desired {
                next.desired_spec = Some(desired);
                next.desired_updated = Some(now);
                if let Some(commit) = commit {
                    next.desired_commit = Some(commit);
                }
            }
            let report = drift::detect(next.desired_spec.as_ref(), next.actual_spec.as_ref());
            if let Some(report) = report.as_ref().filter(|r| r.has_drift()) {
                return Err(fail(format!("drift not resolved (score {:.2})", report.score)));
            }
            next.drift_score = 0.0;
            next.drift_status = DriftStatus::InSync;
            next.drift_details = None;
            reason = "reconciliation confirmed".to_string();
        }
        Trigger::DesiredChanged { desired, commit } => {
            if next.desired_spec.as_ref() == Some(&desired) {
                return Err(fail("desired spec is unchanged".to_string()));
            }
            next.desired_spec = Some(desired);
            next.desired_commit = Some(commit.clone());
            next.desired_updated = Some(now);
            refresh_drift(&mut next, to);
            reason = format!("new desired state at {}", commit);
        }
        Trigger::Import { commit } => {
            let actual = next
                .actual_spec
                .clone()
                .ok_or_else(|| fail("actual spec is not set".to_string()))?;
            next.desired_spec = Some(actual);
            next.desired_commit = Some(commit.clone());
            next.desired_updated = Some(now);
            refresh_drift(&mut next, to);
            reason = format!("imported from cluster at {}", commit);
        }
        Trigger::BeginEditing => {
            let actual = next
                .actual_spec
                .clone()
                .ok_or_else(|| fail("actual spec is not set".to_string()))?;
            next.draft_spec = Some(actual);
            reason = "draft seeded from cluster state".to_string();
        }
        Trigger::OrphanDetected => {
            if next.actual_spec.is_none() {
                return Err(fail("actual spec is not set".to_string()));
            }
            next.desired_spec = None;
            next.desired_commit = None;
            next.desired_updated = None;
            next.draft_spec = None;
            refresh_drift(&mut next, to);
            reason = "desired state no longer declared".to_string();
        }
        Trigger::EditDraft { draft } => {
            next.draft_spec = Some(draft);
            reason = "draft edited".to_string();
        }
        Trigger::ObserveActual { actual, status } => {
            next.actual_spec = Some(actual);
            next.actual_status = status;
            next.actual_updated = Some(now);
            refresh_drift(&mut next, to);
            reason = "cluster state observed".to_string();
        }
        Trigger::RecordDrift { report } => {
            reason = format!("drift recorded (score {:.2})", report.score);
            store_report(&mut next, report, to);
        }
    }

    next.state = to;
    if to != from {
        next.last_state_change = now;
        next.state_change_reason = Some(reason.clone());
    }

    next.check_invariants().map_err(fail)?;

    Ok(Transition {
        from,
        to,
        trigger: trigger_name,
        reason,
        resource: next,
    })
}

/// Applies `triggers` in order, each to the result of the previous one.
///
/// Either every step is valid or nothing is returned. Persist the result
/// with `db::resource_repo::commit_transitions`.
pub fn chain(
    resource: &ManagedResource,
    triggers: Vec<Trigger>,
    now: DateTime<Utc>,
) -> Result<Vec<Transition>, TransitionError> {
    let mut steps: Vec<Transition> = Vec::with_capacity(triggers.len());
    for trigger in triggers {
        let current = steps.last().map(|t| &t.resource).unwrap_or(resource);
        let step = transition(current, trigger, now)?;
        steps.push(step);
    }
    Ok(steps)
}

fn refresh_drift(resource: &mut ManagedResource, state: ResourceState) {
    match drift::detect(resource.desired_spec.as_ref(), resource.actual_spec.as_ref()) {
        Some(report) => store_report(resource, report, state),
        None => {
            resource.drift_score = 0.0;
            resource.drift_status = DriftStatus::InSync;
            resource.drift_details = None;
        }
    }
}

fn store_report(resource: &mut ManagedResource, report: DriftReport, state: ResourceState) {
    resource.drift_score = report.score;
    resource.drift_status = report.status;
    resource.drift_details = if report.has_drift() || state == Drifted {
        Some(report.details)
    } else {
        None
    };
}
