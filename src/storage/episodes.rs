//! `flaky_test_tracking` -- persisted flaky episodes.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::analysis::lifecycle::EpisodeOp;
use crate::analysis::model::{days_between, FlakyEpisode};

const EPISODE_COLUMNS: &str = "id, full_name, project, first_flaky_detected, last_flaky_seen,
     fixed_timestamp, days_flaky, total_failures_while_flaky, root_cause_cluster";

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<FlakyEpisode> {
    Ok(FlakyEpisode {
        id: row.get(0)?,
        full_name: row.get(1)?,
        project: row.get(2)?,
        first_flaky_detected: row.get(3)?,
        last_flaky_seen: row.get(4)?,
        fixed_timestamp: row.get(5)?,
        days_flaky: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
        total_failures_while_flaky: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
        root_cause_cluster: row.get(8)?,
    })
}

/// Episodes with no `fixed_timestamp` for a project.
pub fn open_episodes(conn: &Connection, project: &str) -> Result<Vec<FlakyEpisode>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM flaky_test_tracking
          WHERE project = ?1 AND fixed_timestamp IS NULL
          ORDER BY full_name, first_flaky_detected",
        EPISODE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![project], episode_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read open episodes")
}

/// Every episode of one test, oldest first.
pub fn episodes_for_test(
    conn: &Connection,
    project: &str,
    full_name: &str,
) -> Result<Vec<FlakyEpisode>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM flaky_test_tracking
          WHERE project = ?1 AND full_name = ?2
          ORDER BY first_flaky_detected",
        EPISODE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![project, full_name], episode_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Recompute `days_flaky` of open episodes against `reference_ts`.
pub fn refresh_days(episodes: &mut [FlakyEpisode], reference_ts: i64) {
    for ep in episodes.iter_mut().filter(|e| e.is_open()) {
        ep.days_flaky = days_between(ep.first_flaky_detected, reference_ts);
    }
}

/// Most days flaky first, then most failures, then name.
pub fn rank_worst_first(episodes: &mut [FlakyEpisode]) {
    episodes.sort_by(|a, b| {
        b.days_flaky
            .cmp(&a.days_flaky)
            .then(b.total_failures_while_flaky.cmp(&a.total_failures_while_flaky))
            .then(a.full_name.cmp(&b.full_name))
    });
}

/// Apply one run's lifecycle operations. Callers wrap this in the run's
/// transaction; a failing statement aborts the whole batch.
pub fn apply(conn: &Connection, project: &str, ops: &[EpisodeOp]) -> Result<()> {
    let mut open_stmt = conn.prepare(
        "INSERT INTO flaky_test_tracking
            (full_name, project, first_flaky_detected, last_flaky_seen, fixed_timestamp,
             days_flaky, total_failures_while_flaky, root_cause_cluster)
         VALUES (?1, ?2, ?3, ?3, NULL, 0, ?4, ?5)
         ON CONFLICT(full_name, project, first_flaky_detected) DO UPDATE SET
            last_flaky_seen = MAX(last_flaky_seen, excluded.last_flaky_seen),
            total_failures_while_flaky =
                MAX(total_failures_while_flaky, excluded.total_failures_while_flaky),
            root_cause_cluster = COALESCE(excluded.root_cause_cluster, root_cause_cluster)
         WHERE fixed_timestamp IS NULL",
    )?;
    let mut touch_stmt = conn.prepare(
        "UPDATE flaky_test_tracking
            SET last_flaky_seen = MAX(last_flaky_seen, ?1),
                days_flaky = ?2,
                total_failures_while_flaky = COALESCE(total_failures_while_flaky, 0) + ?3,
                root_cause_cluster = COALESCE(?4, root_cause_cluster)
          WHERE id = ?5 AND fixed_timestamp IS NULL",
    )?;
    let mut close_stmt = conn.prepare(
        "UPDATE flaky_test_tracking
            SET fixed_timestamp = ?1,
                days_flaky = ?2
          WHERE id = ?3 AND fixed_timestamp IS NULL",
    )?;

    for op in ops {
        match op {
            EpisodeOp::Open {
                full_name,
                detected_at,
                failures,
                root_cause_cluster,
            } => {
                open_stmt
                    .execute(params![
                        full_name,
                        project,
                        detected_at,
                        failures,
                        root_cause_cluster
                    ])
                    .with_context(|| format!("Failed to open episode for {}", full_name))?;
            }
            EpisodeOp::Touch {
                episode_id,
                seen_at,
                days_flaky,
                added_failures,
                root_cause_cluster,
            } => {
                touch_stmt.execute(params![
                    seen_at,
                    days_flaky,
                    added_failures,
                    root_cause_cluster,
                    episode_id
                ])?;
            }
            EpisodeOp::Close {
                episode_id,
                fixed_at,
                days_flaky,
            } => {
                close_stmt.execute(params![fixed_at, days_flaky, episode_id])?;
            }
        }
    }
    Ok(())
}

/// A row of the worst-offenders report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Offender {
    pub full_name: String,
    pub first_flaky_detected: i64,
    pub last_flaky_seen: i64,
    pub fixed_timestamp: Option<i64>,
    /// Days flaky so far (open) or until fixed (closed).
    pub current_days_flaky: i64,
    pub total_failures_while_flaky: i64,
    pub still_flaky: bool,
}

/// Tests that have been flaky the longest, open or fixed.
pub fn worst_offenders(
    conn: &Connection,
    project: &str,
    reference_ts: i64,
    limit: usize,
) -> Result<Vec<Offender>> {
    let mut stmt = conn.prepare(
        "SELECT full_name,
                first_flaky_detected,
                last_flaky_seen,
                fixed_timestamp,
                CASE
                    WHEN fixed_timestamp IS NULL
                    THEN MAX(0, (?1 - first_flaky_detected) / 86400)
                    ELSE COALESCE(days_flaky, 0)
                END AS current_days_flaky,
                COALESCE(total_failures_while_flaky, 0) AS failures
           FROM flaky_test_tracking
          WHERE project = ?2
          ORDER BY current_days_flaky DESC, failures DESC, full_name
          LIMIT ?3",
    )?;

    let rows = stmt.query_map(params![reference_ts, project, limit as i64], |row| {
        let fixed_timestamp: Option<i64> = row.get(3)?;
        Ok(Offender {
            full_name: row.get(0)?,
            first_flaky_detected: row.get(1)?,
            last_flaky_seen: row.get(2)?,
            fixed_timestamp,
            current_days_flaky: row.get(4)?,
            total_failures_while_flaky: row.get(5)?,
            still_flaky: fixed_timestamp.is_none(),
        })
    })?;

    let mut offenders = Vec::new();
    for r in rows {
        offenders.push(r?);
    }
    Ok(offenders)
}

/// How long flaky tests stay unresolved, per project.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeToFixSummary {
    pub open_episodes: i64,
    pub fixed_episodes: i64,
    /// Mean `days_flaky` of fixed episodes.
    pub mean_days_to_fix: Option<f64>,
    /// Longest-running open episode, in days, at the reference time.
    pub oldest_open_days: Option<i64>,
}

pub fn time_to_fix_summary(
    conn: &Connection,
    project: &str,
    reference_ts: i64,
) -> Result<TimeToFixSummary> {
    let summary = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN fixed_timestamp IS NULL THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN fixed_timestamp IS NOT NULL THEN 1 ELSE 0 END), 0),
            AVG(CASE WHEN fixed_timestamp IS NOT NULL THEN COALESCE(days_flaky, 0) END),
            MAX(CASE WHEN fixed_timestamp IS NULL
                     THEN MAX(0, (?2 - first_flaky_detected) / 86400) END)
           FROM flaky_test_tracking
          WHERE project = ?1",
        params![project, reference_ts],
        |row| {
            Ok(TimeToFixSummary {
                open_episodes: row.get(0)?,
                fixed_episodes: row.get(1)?,
                mean_days_to_fix: row.get(2)?,
                oldest_open_days: row.get(3)?,
            })
        },
    )?;
    Ok(summary)
}
