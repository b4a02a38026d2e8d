//! Resource repository: CRUD for the `resources` table.
//!
//! Every write bumps `version` and appends to `resource_state_history` in
//! the same transaction. Updates are compare-and-swap on `version`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    format_time, history_repo, parse_json, parse_opt_time, parse_text, parse_time, to_json,
    Database, DatabaseError,
};
use crate::gitops::lifecycle::Transition;
use crate::gitops::resource::{ManagedResource, ResourceIdentity, ResourceState};

fn from_row(row: &Row<'_>) -> Result<ManagedResource, rusqlite::Error> {
    Ok(ManagedResource {
        id: row.get("id")?,
        fabric_id: row.get("fabric_id")?,
        kind: parse_text(row, "kind")?,
        namespace: row.get("namespace")?,
        name: row.get("name")?,
        state: parse_text(row, "state")?,
        draft_spec: parse_json(row, "draft_spec")?,
        desired_spec: parse_json(row, "desired_spec")?,
        actual_spec: parse_json(row, "actual_spec")?,
        desired_commit: row.get("desired_commit")?,
        desired_updated: parse_opt_time(row, "desired_updated")?,
        actual_updated: parse_opt_time(row, "actual_updated")?,
        actual_status: parse_json(row, "actual_status")?,
        drift_score: row.get("drift_score")?,
        drift_details: parse_json(row, "drift_details")?,
        drift_status: parse_text(row, "drift_status")?,
        last_state_change: parse_time(row, "last_state_change")?,
        state_change_reason: row.get("state_change_reason")?,
        source_path: row.get("source_path")?,
        version: row.get("version")?,
        created_at: parse_time(row, "created_at")?,
    })
}

/// Inserts a freshly constructed resource and its creation history entry.
pub fn insert(db: &Database, resource: &ManagedResource, trigger: &str) -> Result<(), DatabaseError> {
    db.with_tx(|tx| insert_in(tx, resource, trigger))
}

pub(crate) fn insert_in(
    conn: &Connection,
    resource: &ManagedResource,
    trigger: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO resources (id, fabric_id, kind, namespace, name, state, draft_spec,
         desired_spec, actual_spec, desired_commit, desired_updated, actual_updated,
         actual_status, drift_score, drift_details, drift_status, last_state_change,
         state_change_reason, source_path, version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
         ?18, ?19, ?20, ?21)",
        params![
            resource.id,
            resource.fabric_id,
            resource.kind.as_str(),
            resource.namespace,
            resource.name,
            resource.state.as_str(),
            to_json(resource.draft_spec.as_ref())?,
            to_json(resource.desired_spec.as_ref())?,
            to_json(resource.actual_spec.as_ref())?,
            resource.desired_commit,
            resource.desired_updated.as_ref().map(format_time),
            resource.actual_updated.as_ref().map(format_time),
            to_json(resource.actual_status.as_ref())?,
            resource.drift_score,
            to_json(resource.drift_details.as_ref())?,
            resource.drift_status.as_str(),
            format_time(&resource.last_state_change),
            resource.state_change_reason,
            resource.source_path,
            resource.version,
            format_time(&resource.created_at),
        ],
    )?;

    history_repo::append_in(
        conn,
        &resource.id,
        &resource.fabric_id,
        None,
        resource.state,
        trigger,
        resource.state_change_reason.as_deref(),
        &resource.created_at,
    )
}

/// Compare-and-swap update: succeeds only if the stored version still
/// equals `resource.version`. Returns the new version.
fn update_in(conn: &Connection, resource: &ManagedResource) -> Result<i64, DatabaseError> {
    let changed = conn.execute(
        "UPDATE resources SET state=?3, draft_spec=?4, desired_spec=?5, actual_spec=?6,
         desired_commit=?7, desired_updated=?8, actual_updated=?9, actual_status=?10,
         drift_score=?11, drift_details=?12, drift_status=?13, last_state_change=?14,
         state_change_reason=?15, source_path=?16, version=version + 1
         WHERE id=?1 AND version=?2",
        params![
            resource.id,
            resource.version,
            resource.state.as_str(),
            to_json(resource.draft_spec.as_ref())?,
            to_json(resource.desired_spec.as_ref())?,
            to_json(resource.actual_spec.as_ref())?,
            resource.desired_commit,
            resource.desired_updated.as_ref().map(format_time),
            resource.actual_updated.as_ref().map(format_time),
            to_json(resource.actual_status.as_ref())?,
            resource.drift_score,
            to_json(resource.drift_details.as_ref())?,
            resource.drift_status.as_str(),
            format_time(&resource.last_state_change),
            resource.state_change_reason,
            resource.source_path,
        ],
    )?;

    if changed == 0 {
        return Err(DatabaseError::Conflict {
            id: resource.id.clone(),
            expected: resource.version,
        });
    }
    Ok(resource.version + 1)
}

/// Persists a computed transition and its history entry atomically.
///
/// Fails with [`DatabaseError::Conflict`] if the record changed since the
/// transition was computed; nothing is written in that case.
pub fn commit_transition(
    db: &Database,
    transition: &Transition,
    at: &DateTime<Utc>,
) -> Result<ManagedResource, DatabaseError> {
    commit_transitions(db, std::slice::from_ref(transition), at)
}

/// Persists a chain of transitions on the same resource in one transaction.
///
/// Each step is expected to carry the version the previous step produced,
/// as [`crate::gitops::lifecycle::chain`] arranges. Returns the final record.
pub fn commit_transitions(
    db: &Database,
    transitions: &[Transition],
    at: &DateTime<Utc>,
) -> Result<ManagedResource, DatabaseError> {
    let Some(first) = transitions.first() else {
        return Err(DatabaseError::NotFound("empty transition chain".to_string()));
    };
    db.with_tx(|tx| {
        let mut stored = first.resource.clone();
        for transition in transitions {
            let mut resource = transition.resource.clone();
            resource.version = stored.version;
            let version = update_in(tx, &resource)?;
            history_repo::append_in(
                tx,
                &resource.id,
                &resource.fabric_id,
                Some(transition.from),
                transition.to,
                transition.trigger,
                Some(&transition.reason),
                at,
            )?;
            resource.version = version;
            stored = resource;
        }
        Ok(stored)
    })
}

/// Records a path change without touching lifecycle fields.
pub fn set_source_path(
    db: &Database,
    resource: &ManagedResource,
    source_path: Option<&str>,
) -> Result<ManagedResource, DatabaseError> {
    let mut updated = resource.clone();
    updated.source_path = source_path.map(str::to_string);
    let version = db.with_conn(|conn| update_in(conn, &updated))?;
    updated.version = version;
    Ok(updated)
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ManagedResource>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row("SELECT * FROM resources WHERE id = ?1", params![id], from_row)
            .optional()
            .map_err(DatabaseError::from)
    })
}

pub fn find_by_identity(
    db: &Database,
    fabric_id: &str,
    identity: &ResourceIdentity,
) -> Result<Option<ManagedResource>, DatabaseError> {
    db.with_conn(|conn| find_by_identity_in(conn, fabric_id, identity))
}

pub(crate) fn find_by_identity_in(
    conn: &Connection,
    fabric_id: &str,
    identity: &ResourceIdentity,
) -> Result<Option<ManagedResource>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM resources WHERE fabric_id = ?1 AND kind = ?2 AND namespace = ?3 AND name = ?4",
        params![fabric_id, identity.kind.as_str(), identity.namespace, identity.name],
        from_row,
    )
    .optional()
    .map_err(DatabaseError::from)
}

/// All resources of a fabric, ordered by kind, namespace and name.
pub fn list_by_fabric(db: &Database, fabric_id: &str) -> Result<Vec<ManagedResource>, DatabaseError> {
    db.with_conn(|conn| list_by_fabric_in(conn, fabric_id))
}

pub(crate) fn list_by_fabric_in(
    conn: &Connection,
    fabric_id: &str,
) -> Result<Vec<ManagedResource>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM resources WHERE fabric_id = ?1 ORDER BY kind, namespace, name",
    )?;
    let rows = stmt.query_map(params![fabric_id], from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
}

pub fn list_by_state(
    db: &Database,
    fabric_id: &str,
    state: ResourceState,
) -> Result<Vec<ManagedResource>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM resources WHERE fabric_id = ?1 AND state = ?2 ORDER BY kind, namespace, name",
        )?;
        let rows = stmt.query_map(params![fabric_id, state.as_str()], from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
    })
}

/// Deletes a retired resource, leaving a final history entry behind.
pub fn delete(
    db: &Database,
    resource: &ManagedResource,
    reason: &str,
    at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    db.with_tx(|tx| {
        let removed = tx.execute(
            "DELETE FROM resources WHERE id = ?1 AND version = ?2",
            params![resource.id, resource.version],
        )?;
        if removed == 0 {
            return Err(DatabaseError::Conflict {
                id: resource.id.clone(),
                expected: resource.version,
            });
        }
        history_repo::append_in(
            tx,
            &resource.id,
            &resource.fabric_id,
            Some(resource.state),
            resource.state,
            "retired",
            Some(reason),
            at,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::lifecycle::{transition, Trigger};
    use crate::gitops::resource::{ResourceKind, SpecDocument};

    fn ingested(name: &str) -> ManagedResource {
        ManagedResource::ingested(
            "f1",
            &ResourceIdentity::new(ResourceKind::Vpc, "default", name),
            SpecDocument::new().with("vlan", 10),
            "c1".to_string(),
            format!("vpcs/{}.yaml", name),
            Utc::now(),
        )
    }

    #[test]
    fn test_insert_and_find_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let resource = ingested("vpc-1");
        insert(&db, &resource, "ingested").unwrap();

        let found = find_by_id(&db, &resource.id).unwrap().unwrap();
        assert_eq!(found.identity(), resource.identity());
        assert_eq!(found.desired_spec, resource.desired_spec);
        assert_eq!(found.state, ResourceState::Committed);
        assert_eq!(found.drift_status, resource.drift_status);

        let by_identity = find_by_identity(&db, "f1", &resource.identity()).unwrap();
        assert!(by_identity.is_some());
        assert!(find_by_identity(&db, "f2", &resource.identity()).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, &ingested("vpc-1"), "ingested").unwrap();
        assert!(insert(&db, &ingested("vpc-1"), "ingested").is_err());
    }

    #[test]
    fn test_commit_transition_bumps_version_and_logs() {
        let db = Database::open_in_memory().unwrap();
        let resource = ingested("vpc-1");
        insert(&db, &resource, "ingested").unwrap();

        let now = Utc::now();
        let t = transition(&resource, Trigger::SourceSyncObserved, now).unwrap();
        let stored = commit_transition(&db, &t, &now).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.state, ResourceState::Pending);

        let history = history_repo::list_for_resource(&db, &resource.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].trigger, "source_sync_observed");
    }

    #[test]
    fn test_stale_transition_conflicts_without_writing() {
        let db = Database::open_in_memory().unwrap();
        let resource = ingested("vpc-1");
        insert(&db, &resource, "ingested").unwrap();
        let now = Utc::now();

        let first = transition(&resource, Trigger::SourceSyncObserved, now).unwrap();
        commit_transition(&db, &first, &now).unwrap();

        // Computed against version 0, which is gone now.
        let stale = transition(&resource, Trigger::SourceSyncObserved, now).unwrap();
        let err = commit_transition(&db, &stale, &now).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(history_repo::list_for_resource(&db, &resource.id).unwrap().len(), 2);
    }

    #[test]
    fn test_commit_transitions_applies_chain_atomically() {
        let db = Database::open_in_memory().unwrap();
        let resource = ingested("vpc-1");
        insert(&db, &resource, "ingested").unwrap();
        let now = Utc::now();

        let steps = crate::gitops::lifecycle::chain(
            &resource,
            vec![
                Trigger::SourceSyncObserved,
                Trigger::ObserveActual {
                    actual: SpecDocument::new().with("vlan", 10),
                    status: None,
                },
                Trigger::ApplyConfirmed,
            ],
            now,
        )
        .unwrap();
        let stored = commit_transitions(&db, &steps, &now).unwrap();
        assert_eq!(stored.state, ResourceState::Synced);
        assert_eq!(stored.version, 3);
        assert_eq!(find_by_id(&db, &resource.id).unwrap().unwrap().version, 3);
        assert_eq!(history_repo::list_for_resource(&db, &resource.id).unwrap().len(), 4);

        // Replaying the same chain conflicts on its first step and writes nothing.
        assert!(commit_transitions(&db, &steps, &now).unwrap_err().is_conflict());
        assert_eq!(history_repo::list_for_resource(&db, &resource.id).unwrap().len(), 4);
    }

    #[test]
    fn test_delete_keeps_history() {
        let db = Database::open_in_memory().unwrap();
        let resource = ingested("vpc-1");
        insert(&db, &resource, "ingested").unwrap();
        delete(&db, &resource, "gone", &Utc::now()).unwrap();

        assert!(find_by_id(&db, &resource.id).unwrap().is_none());
        let history = history_repo::list_for_resource(&db, &resource.id).unwrap();
        assert_eq!(history.last().unwrap().trigger, "retired");
    }

    #[test]
    fn test_list_by_state() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, &ingested("b"), "ingested").unwrap();
        insert(&db, &ingested("a"), "ingested").unwrap();

        let committed = list_by_state(&db, "f1", ResourceState::Committed).unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].name, "a");
        assert!(list_by_state(&db, "f1", ResourceState::Synced).unwrap().is_empty());
        assert_eq!(list_by_fabric(&db, "f1").unwrap().len(), 2);
    }
}
