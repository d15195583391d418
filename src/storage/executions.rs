//! Persisted test execution history.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::analysis::model::{TestExecution, TestStatus};

/// Insert a batch of executions. Rows already present for the same
/// `(full_name, project, run_id)` are left untouched, so re-ingesting a batch
/// is a no-op. Returns the number of newly inserted executions.
pub fn insert_batch(conn: &Connection, batch: &[TestExecution]) -> Result<usize> {
    let mut insert_stmt = conn.prepare(
        "INSERT OR IGNORE INTO test_executions
            (full_name, project, status, timestamp, run_id, failure_signature)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;

    let mut inserted = 0;
    for e in batch {
        inserted += insert_stmt
            .execute(params![
                e.full_name,
                e.project,
                e.status.as_str(),
                e.timestamp,
                e.run_id,
                e.failure_signature
            ])
            .with_context(|| format!("Failed to insert execution of {}", e.full_name))?;
    }

    record_runs(conn, batch)?;
    Ok(inserted)
}

/// One `runs` row per `(project, run_id)`, stamped with the earliest timestamp
/// seen. A commit SHA, once known, is kept when later batches omit it.
fn record_runs(conn: &Connection, batch: &[TestExecution]) -> Result<()> {
    let mut runs: BTreeMap<(&str, &str), (i64, Option<&str>)> = BTreeMap::new();
    for e in batch {
        let sha = e.commit_sha.as_deref().filter(|s| !s.trim().is_empty());
        runs.entry((e.project.as_str(), e.run_id.as_str()))
            .and_modify(|(ts, commit)| {
                *ts = (*ts).min(e.timestamp);
                if commit.is_none() {
                    *commit = sha;
                }
            })
            .or_insert((e.timestamp, sha));
    }

    let mut stmt = conn.prepare(
        "INSERT INTO runs (project, run_id, run_ts, commit_sha) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(project, run_id) DO UPDATE SET
            run_ts = MIN(run_ts, excluded.run_ts),
            commit_sha = COALESCE(excluded.commit_sha, commit_sha)",
    )?;
    for ((project, run_id), (ts, commit)) in runs {
        stmt.execute(params![project, run_id, ts, commit])?;
    }
    Ok(())
}

/// The most recent `limit` executions of one test, oldest first.
pub fn fetch_window(
    conn: &Connection,
    project: &str,
    full_name: &str,
    limit: usize,
) -> Result<Vec<TestExecution>> {
    let mut stmt = conn.prepare_cached(
        "SELECT e.full_name, e.project, e.status, e.timestamp, e.run_id,
                e.failure_signature, r.commit_sha
           FROM test_executions e
           LEFT JOIN runs r ON r.project = e.project AND r.run_id = e.run_id
          WHERE e.project = ?1 AND e.full_name = ?2
          ORDER BY e.timestamp DESC, e.id DESC
          LIMIT ?3",
    )?;

    let rows = stmt.query_map(params![project, full_name, limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut window = Vec::new();
    for r in rows {
        let (full_name, project, status, timestamp, run_id, failure_signature, commit_sha) = r?;
        let status: TestStatus = status
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .with_context(|| format!("Corrupt status for {}", full_name))?;
        window.push(TestExecution {
            full_name,
            project,
            status,
            timestamp,
            run_id,
            failure_signature,
            commit_sha,
        });
    }

    window.reverse();
    Ok(window)
}

pub fn run_count(conn: &Connection, project: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM runs WHERE project = ?1",
        params![project],
        |row| row.get(0),
    )?;
    Ok(count)
}
