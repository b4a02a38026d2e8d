//! Append-only state history for resources.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{format_time, parse_opt_text, parse_text, parse_time, Database, DatabaseError};
use crate::gitops::resource::ResourceState;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: i64,
    pub resource_id: String,
    pub fabric_id: String,
    /// `None` for the creation entry.
    pub from_state: Option<ResourceState>,
    pub to_state: ResourceState,
    pub trigger: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            resource_id: row.get("resource_id")?,
            fabric_id: row.get("fabric_id")?,
            from_state: parse_opt_text(row, "from_state")?,
            to_state: parse_text(row, "to_state")?,
            trigger: row.get("trigger_name")?,
            reason: row.get("reason")?,
            created_at: parse_time(row, "created_at")?,
        })
    }
}

/// Appends an entry on an open connection or transaction.
#[allow(clippy::too_many_arguments)]
pub(crate) fn append_in(
    conn: &Connection,
    resource_id: &str,
    fabric_id: &str,
    from: Option<ResourceState>,
    to: ResourceState,
    trigger: &str,
    reason: Option<&str>,
    at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO resource_state_history
         (resource_id, fabric_id, from_state, to_state, trigger_name, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            resource_id,
            fabric_id,
            from.map(|s| s.as_str()),
            to.as_str(),
            trigger,
            reason,
            format_time(at),
        ],
    )?;
    Ok(())
}

/// History of one resource, oldest first.
pub fn list_for_resource(db: &Database, resource_id: &str) -> Result<Vec<HistoryEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM resource_state_history WHERE resource_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![resource_id], HistoryEntry::from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
    })
}

pub fn count_for_fabric(db: &Database, fabric_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM resource_state_history WHERE fabric_id = ?1",
            params![fabric_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
