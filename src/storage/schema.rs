//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY,
            project TEXT NOT NULL,
            run_id TEXT NOT NULL,
            run_ts INTEGER NOT NULL,
            commit_sha TEXT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(project, run_id)
        );

        CREATE TABLE IF NOT EXISTS test_executions (
            id INTEGER PRIMARY KEY,
            full_name TEXT NOT NULL,
            project TEXT NOT NULL,
            status TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            failure_signature TEXT,
            UNIQUE(full_name, project, run_id)
        );

        CREATE TABLE IF NOT EXISTS flaky_test_tracking (
            id INTEGER PRIMARY KEY,
            full_name TEXT NOT NULL,
            project TEXT NOT NULL,
            first_flaky_detected INTEGER NOT NULL,
            last_flaky_seen INTEGER NOT NULL,
            fixed_timestamp INTEGER NULL,
            days_flaky INTEGER,
            total_failures_while_flaky INTEGER,
            root_cause_cluster TEXT,
            UNIQUE(full_name, project, first_flaky_detected)
        );

        CREATE INDEX IF NOT EXISTS idx_executions_test
            ON test_executions(project, full_name, timestamp);
        CREATE INDEX IF NOT EXISTS idx_flaky_tracking_project ON flaky_test_tracking(project);
        CREATE INDEX IF NOT EXISTS idx_flaky_tracking_status ON flaky_test_tracking(fixed_timestamp);",
    )?;

    // v2: commit SHA per run
    if !has_column(conn, "runs", "commit_sha")? {
        conn.execute_batch("ALTER TABLE runs ADD COLUMN commit_sha TEXT NULL;")?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}
