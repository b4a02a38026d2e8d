//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order, each inside its own transaction.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_resources_table",
        sql: include_str!("sql/001_create_resources.sql"),
    },
    Migration {
        version: 2,
        description: "create_resource_state_history_table",
        sql: include_str!("sql/002_create_resource_state_history.sql"),
    },
    Migration {
        version: 3,
        description: "create_alerts_table",
        sql: include_str!("sql/003_create_alerts.sql"),
    },
    Migration {
        version: 4,
        description: "create_fabrics_table",
        sql: include_str!("sql/004_create_fabrics.sql"),
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in migrations {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, description) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.description
        );
        if let Err(e) = conn.execute_batch(&batch) {
            if !conn.is_autocommit() {
                if let Err(rollback) = conn.execute_batch("ROLLBACK;") {
                    log::warn!(
                        "Rollback of migration v{} failed: {}",
                        migration.version,
                        rollback
                    );
                }
            }
            return Err(DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = migrated();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = migrated();
        run_all(&conn).unwrap();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_failed_migration_rolls_back() {
        let conn = migrated();
        let broken = [Migration {
            version: 99,
            description: "broken",
            sql: "CREATE TABLE half_done (id INTEGER);\nINSERT INTO missing_table VALUES (1);",
        }];

        let result = apply(&conn, &broken);
        assert!(matches!(result, Err(DatabaseError::Migration { version: 99, .. })));
        assert!(conn.is_autocommit());

        let leftovers: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'half_done'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(leftovers, 0);
        let recorded: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations WHERE version = 99", [], |r| r.get(0))
            .unwrap();
        assert_eq!(recorded, 0);
    }

    #[test]
    fn test_open_alert_uniqueness_is_enforced() {
        let conn = migrated();
        let insert = "INSERT INTO alerts (id, fabric_id, subject, alert_type, severity, status, priority, message, created_at)
                      VALUES (?1, 'f1', 'vpc/x', 'conflict_detected', 'CRITICAL', ?2, 10, 'dup', '2026-01-01T00:00:00Z')";
        conn.execute(insert, rusqlite::params!["a1", "ACTIVE"]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["a2", "ACTIVE"]).is_err());
        // closed alerts do not count
        conn.execute(
            "INSERT INTO alerts (id, fabric_id, subject, alert_type, severity, status, priority, message, created_at, resolved_at, resolved_action)
             VALUES ('a3', 'f1', 'vpc/x', 'conflict_detected', 'CRITICAL', 'RESOLVED', 10, 'dup', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 'ignore')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_resolved_alert_requires_action() {
        let conn = migrated();
        let result = conn.execute(
            "INSERT INTO alerts (id, fabric_id, subject, alert_type, severity, status, priority, message, created_at)
             VALUES ('a1', 'f1', 's', 'sync_failure', 'HIGH', 'RESOLVED', 30, 'x', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }
}
