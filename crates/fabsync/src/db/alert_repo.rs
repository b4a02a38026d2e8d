//! Alert repository: CRUD for the `alerts` table.
//!
//! Alerts are never deleted. At most one open alert exists per condition
//! (fabric, type, resource, subject); the table enforces it with a partial
//! unique index.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    format_time, parse_json, parse_opt_text, parse_opt_time, parse_text, parse_time, to_json,
    Database, DatabaseError,
};
use crate::gitops::alert::{Alert, AlertType};

fn from_row(row: &Row<'_>) -> Result<Alert, rusqlite::Error> {
    Ok(Alert {
        id: row.get("id")?,
        fabric_id: row.get("fabric_id")?,
        resource_id: row.get("resource_id")?,
        resource_kind: parse_opt_text(row, "resource_kind")?,
        resource_name: row.get("resource_name")?,
        subject: row.get("subject")?,
        alert_type: parse_text(row, "alert_type")?,
        severity: parse_text(row, "severity")?,
        status: parse_text(row, "status")?,
        priority: row.get("priority")?,
        message: row.get("message")?,
        details: parse_json(row, "details")?,
        created_at: parse_time(row, "created_at")?,
        acknowledged_at: parse_opt_time(row, "acknowledged_at")?,
        acknowledged_by: row.get("acknowledged_by")?,
        resolved_at: parse_opt_time(row, "resolved_at")?,
        resolved_by: row.get("resolved_by")?,
        resolved_action: parse_opt_text(row, "resolved_action")?,
        suppression_reason: row.get("suppression_reason")?,
        batch_id: row.get("batch_id")?,
    })
}

pub fn insert(db: &Database, alert: &Alert) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_in(conn, alert))
}

pub(crate) fn insert_in(conn: &Connection, alert: &Alert) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO alerts (id, fabric_id, resource_id, resource_kind, resource_name, subject,
         alert_type, severity, status, priority, message, details, created_at, acknowledged_at,
         acknowledged_by, resolved_at, resolved_by, resolved_action, suppression_reason, batch_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
         ?19, ?20)",
        params![
            alert.id,
            alert.fabric_id,
            alert.resource_id,
            alert.resource_kind.map(|k| k.as_str()),
            alert.resource_name,
            alert.subject,
            alert.alert_type.as_str(),
            alert.severity.as_str(),
            alert.status.as_str(),
            alert.priority,
            alert.message,
            to_json(alert.details.as_ref())?,
            format_time(&alert.created_at),
            alert.acknowledged_at.as_ref().map(format_time),
            alert.acknowledged_by,
            alert.resolved_at.as_ref().map(format_time),
            alert.resolved_by,
            alert.resolved_action.map(|a| a.as_str()),
            alert.suppression_reason,
            alert.batch_id,
        ],
    )?;
    Ok(())
}

/// Overwrites the mutable fields of an alert.
pub fn update(db: &Database, alert: &Alert) -> Result<(), DatabaseError> {
    db.with_conn(|conn| update_in(conn, alert))
}

pub(crate) fn update_in(conn: &Connection, alert: &Alert) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE alerts SET severity=?2, status=?3, priority=?4, message=?5, details=?6,
         acknowledged_at=?7, acknowledged_by=?8, resolved_at=?9, resolved_by=?10,
         resolved_action=?11, suppression_reason=?12, batch_id=?13
         WHERE id=?1",
        params![
            alert.id,
            alert.severity.as_str(),
            alert.status.as_str(),
            alert.priority,
            alert.message,
            to_json(alert.details.as_ref())?,
            alert.acknowledged_at.as_ref().map(format_time),
            alert.acknowledged_by,
            alert.resolved_at.as_ref().map(format_time),
            alert.resolved_by,
            alert.resolved_action.map(|a| a.as_str()),
            alert.suppression_reason,
            alert.batch_id,
        ],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound(alert.id.clone()));
    }
    Ok(())
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Alert>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row("SELECT * FROM alerts WHERE id = ?1", params![id], from_row)
            .optional()
            .map_err(DatabaseError::from)
    })
}

/// The open alert for a condition, if one exists.
pub(crate) fn find_open_in(
    conn: &Connection,
    fabric_id: &str,
    alert_type: AlertType,
    resource_id: Option<&str>,
    subject: &str,
) -> Result<Option<Alert>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM alerts WHERE fabric_id = ?1 AND alert_type = ?2
         AND COALESCE(resource_id, '') = COALESCE(?3, '') AND subject = ?4
         AND status IN ('ACTIVE', 'ACKNOWLEDGED')",
        params![fabric_id, alert_type.as_str(), resource_id, subject],
        from_row,
    )
    .optional()
    .map_err(DatabaseError::from)
}

/// Open alerts of a fabric, highest stored priority first.
pub fn list_open(db: &Database, fabric_id: &str) -> Result<Vec<Alert>, DatabaseError> {
    db.with_conn(|conn| list_open_in(conn, fabric_id))
}

pub(crate) fn list_open_in(conn: &Connection, fabric_id: &str) -> Result<Vec<Alert>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM alerts WHERE fabric_id = ?1 AND status IN ('ACTIVE', 'ACKNOWLEDGED')
         ORDER BY severity = 'CRITICAL' DESC, priority, created_at",
    )?;
    let rows = stmt.query_map(params![fabric_id], from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
}

/// Every alert ever raised for a resource, oldest first.
pub fn list_for_resource(db: &Database, resource_id: &str) -> Result<Vec<Alert>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM alerts WHERE resource_id = ?1 ORDER BY created_at")?;
        let rows = stmt.query_map(params![resource_id], from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
    })
}

/// Open alerts attached to a resource.
pub(crate) fn list_open_for_resource_in(
    conn: &Connection,
    resource_id: &str,
) -> Result<Vec<Alert>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM alerts WHERE resource_id = ?1 AND status IN ('ACTIVE', 'ACKNOWLEDGED')
         ORDER BY created_at",
    )?;
    let rows = stmt.query_map(params![resource_id], from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
}

pub fn list_all(db: &Database, fabric_id: &str) -> Result<Vec<Alert>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM alerts WHERE fabric_id = ?1 ORDER BY created_at")?;
        let rows = stmt.query_map(params![fabric_id], from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
    })
}
