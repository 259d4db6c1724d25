//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies pending
//! ones in order, each in its own transaction together with its tracking row.

use rusqlite::Connection;
use tracing::info;

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
        description: "create_report_tables",
        sql: include_str!("sql/001_create_reports.sql"),
    },
    Migration {
        version: 2,
        description: "create_processed_sources_table",
        sql: include_str!("sql/002_create_processed_sources.sql"),
    },
    Migration {
        version: 3,
        description: "create_stats_views",
        sql: include_str!("sql/003_create_stats_views.sql"),
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
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

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        info!(
            version = migration.version,
            description = migration.description,
            "Running migration"
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();
        conn
    }

    fn object_exists(conn: &Connection, kind: &str, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
            rusqlite::params![kind, name],
            |r| r.get::<_, u32>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = fresh();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);

        for table in ["reports", "records", "dkim_auth", "spf_auth", "processed_sources"] {
            assert!(object_exists(&conn, "table", table), "missing table {}", table);
        }
        for view in ["domain_stats", "source_ip_stats"] {
            assert!(object_exists(&conn, "view", view), "missing view {}", view);
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = fresh();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_record_count_must_be_positive() {
        let conn = fresh();
        conn.execute(
            "INSERT INTO reports (report_id, date_range_begin, date_range_end, domain, p, sp, raw_xml, created_at)
             VALUES ('r1', 0, 86400, 'example.com', 'none', 'none', '<feedback/>', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO records (report_id, source_ip, count, disposition) VALUES (1, '192.0.2.1', 0, 'none')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_deleting_report_cascades() {
        let conn = fresh();
        conn.execute_batch(
            "INSERT INTO reports (report_id, date_range_begin, date_range_end, domain, p, sp, raw_xml, created_at)
             VALUES ('r1', 0, 86400, 'example.com', 'none', 'none', '<feedback/>', '2026-01-01T00:00:00Z');
             INSERT INTO records (report_id, source_ip, count, disposition) VALUES (1, '192.0.2.1', 3, 'none');
             INSERT INTO dkim_auth (record_id, domain, result) VALUES (1, 'example.com', 'pass');
             INSERT INTO spf_auth (record_id, domain, result) VALUES (1, 'example.com', 'pass');
             DELETE FROM reports;",
        )
        .unwrap();

        for table in ["records", "dkim_auth", "spf_auth"] {
            let count: u32 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "{} not cascaded", table);
        }
    }
}
