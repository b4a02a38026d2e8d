//! Fabric repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    alert_repo, format_time, parse_opt_time, parse_text, parse_time, resource_repo, Database,
    DatabaseError,
};
use crate::gitops::fabric::{self, ConnectionStatus, Fabric, FabricCounts};

fn from_row(row: &Row<'_>) -> Result<Fabric, rusqlite::Error> {
    Ok(Fabric {
        id: row.get("id")?,
        name: row.get("name")?,
        connection_status: parse_text(row, "connection_status")?,
        sync_status: parse_text(row, "sync_status")?,
        counts: FabricCounts {
            total: row.get("total_resources")?,
            draft: row.get("draft_count")?,
            committed: row.get("committed_count")?,
            pending: row.get("pending_count")?,
            synced: row.get("synced_count")?,
            drifted: row.get("drifted_count")?,
            orphaned: row.get("orphaned_count")?,
            open_alerts: row.get("open_alerts")?,
            critical_alerts: row.get("critical_alerts")?,
        },
        last_sync_at: parse_opt_time(row, "last_sync_at")?,
        last_error: row.get("last_error")?,
        updated_at: parse_time(row, "updated_at")?,
    })
}

fn upsert_in(conn: &Connection, fabric: &Fabric) -> Result<(), DatabaseError> {
    let c = &fabric.counts;
    conn.execute(
        "INSERT INTO fabrics (id, name, connection_status, sync_status, total_resources,
         draft_count, committed_count, pending_count, synced_count, drifted_count,
         orphaned_count, open_alerts, critical_alerts, last_sync_at, last_error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(id) DO UPDATE SET name=excluded.name,
         connection_status=excluded.connection_status, sync_status=excluded.sync_status,
         total_resources=excluded.total_resources, draft_count=excluded.draft_count,
         committed_count=excluded.committed_count, pending_count=excluded.pending_count,
         synced_count=excluded.synced_count, drifted_count=excluded.drifted_count,
         orphaned_count=excluded.orphaned_count, open_alerts=excluded.open_alerts,
         critical_alerts=excluded.critical_alerts, last_sync_at=excluded.last_sync_at,
         last_error=excluded.last_error, updated_at=excluded.updated_at",
        params![
            fabric.id,
            fabric.name,
            fabric.connection_status.as_str(),
            fabric.sync_status.as_str(),
            c.total,
            c.draft,
            c.committed,
            c.pending,
            c.synced,
            c.drifted,
            c.orphaned,
            c.open_alerts,
            c.critical_alerts,
            fabric.last_sync_at.as_ref().map(format_time),
            fabric.last_error,
            format_time(&fabric.updated_at),
        ],
    )?;
    Ok(())
}

fn find_in(conn: &Connection, id: &str) -> Result<Option<Fabric>, DatabaseError> {
    conn.query_row("SELECT * FROM fabrics WHERE id = ?1", params![id], from_row)
        .optional()
        .map_err(DatabaseError::from)
}

pub fn find(db: &Database, id: &str) -> Result<Option<Fabric>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

pub fn save(db: &Database, fabric: &Fabric) -> Result<(), DatabaseError> {
    db.with_conn(|conn| upsert_in(conn, fabric))
}

/// Loads a fabric, creating it if it does not exist yet.
pub fn ensure(db: &Database, id: &str, name: &str, now: DateTime<Utc>) -> Result<Fabric, DatabaseError> {
    db.with_tx(|tx| {
        if let Some(existing) = find_in(tx, id)? {
            return Ok(existing);
        }
        let fabric = Fabric::new(id, name, now);
        upsert_in(tx, &fabric)?;
        log::info!("Registered fabric {} ({})", id, name);
        Ok(fabric)
    })
}

pub fn set_connection_status(
    db: &Database,
    id: &str,
    status: ConnectionStatus,
    last_error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE fabrics SET connection_status = ?2, last_error = COALESCE(?3, last_error),
             updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), last_error, format_time(&now)],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound(id.to_string()));
        }
        Ok(())
    })
}

/// Recomputes and stores a fabric's status and counters in one transaction.
pub fn recompute(db: &Database, id: &str, now: DateTime<Utc>) -> Result<Fabric, DatabaseError> {
    db.with_tx(|tx| {
        let current = find_in(tx, id)?.ok_or_else(|| DatabaseError::NotFound(id.to_string()))?;
        let resources = resource_repo::list_by_fabric_in(tx, id)?;
        let alerts = alert_repo::list_open_in(tx, id)?;
        let updated = fabric::recompute(&current, &resources, &alerts, now);
        upsert_in(tx, &updated)?;
        Ok(updated)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::alert::{Alert, AlertType, Severity};
    use crate::gitops::fabric::SyncStatus;

    #[test]
    fn test_ensure_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let first = ensure(&db, "f1", "lab", now).unwrap();
        assert_eq!(first.sync_status, SyncStatus::NeverSynced);
        let second = ensure(&db, "f1", "renamed", now).unwrap();
        assert_eq!(second.name, "lab");
    }

    #[test]
    fn test_connection_status_update() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        ensure(&db, "f1", "lab", now).unwrap();
        set_connection_status(&db, "f1", ConnectionStatus::Failed, Some("down"), now).unwrap();

        let fabric = find(&db, "f1").unwrap().unwrap();
        assert_eq!(fabric.connection_status, ConnectionStatus::Failed);
        assert_eq!(fabric.last_error.as_deref(), Some("down"));
        assert!(set_connection_status(&db, "nope", ConnectionStatus::Connected, None, now).is_err());
    }

    #[test]
    fn test_recompute_reads_open_alerts() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        ensure(&db, "f1", "lab", now).unwrap();
        alert_repo::insert(
            &db,
            &Alert::new("f1", AlertType::SyncFailure, Severity::High, "cluster", "down", now),
        )
        .unwrap();

        let fabric = recompute(&db, "f1", now).unwrap();
        assert_eq!(fabric.sync_status, SyncStatus::Error);
        assert_eq!(fabric.counts.open_alerts, 1);
        assert_eq!(find(&db, "f1").unwrap().unwrap(), fabric);
    }
}
