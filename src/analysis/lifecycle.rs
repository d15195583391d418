//! Flaky-episode lifecycle: NONE -> OPEN -> CLOSED, one row per episode.
//!
//! A run is planned as a pure set operation over (suspect tests this run) and
//! (tests with an open episode), then written as one batch inside the caller's
//! transaction. Closed episodes are never reopened; a test that turns suspect
//! again gets a new row keyed by the new detection time.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::analysis::model::{days_between, FlakyEpisode};
use crate::storage::episodes;

/// A test classified suspect in the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuspectTest {
    /// FAIL/ERROR executions of the test in the current run.
    pub failures_this_run: i64,
    pub root_cause_cluster: Option<String>,
}

/// One row-level change to `flaky_test_tracking`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpisodeOp {
    /// Start a new episode (insert-or-update on the episode key).
    Open {
        full_name: String,
        detected_at: i64,
        failures: i64,
        root_cause_cluster: Option<String>,
    },
    /// Still suspect: extend the open episode.
    Touch {
        episode_id: i64,
        seen_at: i64,
        days_flaky: i64,
        added_failures: i64,
        root_cause_cluster: Option<String>,
    },
    /// No longer suspect: stamp the fix time.
    Close {
        episode_id: i64,
        fixed_at: i64,
        days_flaky: i64,
    },
}

/// Counts of transitions applied in one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleSummary {
    pub opened: usize,
    pub updated: usize,
    pub closed: usize,
}

impl LifecycleSummary {
    fn from_ops(ops: &[EpisodeOp]) -> Self {
        let mut summary = Self::default();
        for op in ops {
            match op {
                EpisodeOp::Open { .. } => summary.opened += 1,
                EpisodeOp::Touch { .. } => summary.updated += 1,
                EpisodeOp::Close { .. } => summary.closed += 1,
            }
        }
        summary
    }
}

pub struct LifecycleTracker;

impl LifecycleTracker {
    /// Compute the operations for one run.
    ///
    /// Failures are only added when the run is newer than the episode's
    /// `last_flaky_seen`, so replaying a run does not double count.
    pub fn plan(
        run_ts: i64,
        suspects: &BTreeMap<String, SuspectTest>,
        open: &[FlakyEpisode],
    ) -> Vec<EpisodeOp> {
        // Latest open episode per test; older duplicates only get closed.
        let mut open_by_test: BTreeMap<&str, Vec<&FlakyEpisode>> = BTreeMap::new();
        for ep in open.iter().filter(|e| e.is_open()) {
            open_by_test.entry(ep.full_name.as_str()).or_default().push(ep);
        }
        for eps in open_by_test.values_mut() {
            eps.sort_by_key(|e| e.first_flaky_detected);
        }

        let mut ops = Vec::new();

        // NONE -> OPEN and OPEN -> OPEN
        for (name, suspect) in suspects {
            match open_by_test.get(name.as_str()).and_then(|eps| eps.last()) {
                None => ops.push(EpisodeOp::Open {
                    full_name: name.clone(),
                    detected_at: run_ts,
                    failures: suspect.failures_this_run,
                    root_cause_cluster: suspect.root_cause_cluster.clone(),
                }),
                Some(ep) => {
                    let added = if run_ts > ep.last_flaky_seen {
                        suspect.failures_this_run
                    } else {
                        0
                    };
                    ops.push(EpisodeOp::Touch {
                        episode_id: ep.id,
                        seen_at: run_ts,
                        days_flaky: days_between(
                            ep.first_flaky_detected,
                            run_ts.max(ep.last_flaky_seen),
                        ),
                        added_failures: added,
                        root_cause_cluster: suspect.root_cause_cluster.clone(),
                    });
                }
            }
        }

        // OPEN -> CLOSED
        let suspect_names: BTreeSet<&str> = suspects.keys().map(String::as_str).collect();
        for (name, eps) in &open_by_test {
            if suspect_names.contains(name) {
                continue;
            }
            for ep in eps {
                ops.push(EpisodeOp::Close {
                    episode_id: ep.id,
                    fixed_at: run_ts,
                    days_flaky: days_between(ep.first_flaky_detected, run_ts),
                });
            }
        }

        ops
    }

    /// Fetch open episodes, plan, and apply, all on `conn`.
    ///
    /// Pass a transaction so the read and the writes see one consistent state.
    pub fn track(
        conn: &Connection,
        project: &str,
        run_ts: i64,
        suspects: &BTreeMap<String, SuspectTest>,
    ) -> Result<LifecycleSummary> {
        let open = episodes::open_episodes(conn, project)?;
        let ops = Self::plan(run_ts, suspects, &open);
        for op in &ops {
            debug!(%project, ?op, "episode transition");
        }
        episodes::apply(conn, project, &ops)?;

        let summary = LifecycleSummary::from_ops(&ops);
        info!(
            %project,
            opened = summary.opened,
            updated = summary.updated,
            closed = summary.closed,
            "Lifecycle tracking updated"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::model::SECONDS_PER_DAY;
    use crate::storage::schema::migrate;

    const DAY: i64 = SECONDS_PER_DAY;

    fn suspects(entries: &[(&str, i64)]) -> BTreeMap<String, SuspectTest> {
        entries
            .iter()
            .map(|(name, fails)| {
                (
                    name.to_string(),
                    SuspectTest {
                        failures_this_run: *fails,
                        root_cause_cluster: None,
                    },
                )
            })
            .collect()
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn test_plan_set_operations() {
        let open = vec![
            FlakyEpisode {
                id: 1,
                full_name: "still".into(),
                project: "p".into(),
                first_flaky_detected: 0,
                last_flaky_seen: DAY,
                fixed_timestamp: None,
                days_flaky: 1,
                total_failures_while_flaky: 2,
                root_cause_cluster: None,
            },
            FlakyEpisode {
                id: 2,
                full_name: "fixed".into(),
                project: "p".into(),
                first_flaky_detected: 0,
                last_flaky_seen: DAY,
                fixed_timestamp: None,
                days_flaky: 1,
                total_failures_while_flaky: 2,
                root_cause_cluster: None,
            },
        ];
        let ops = LifecycleTracker::plan(3 * DAY, &suspects(&[("still", 1), ("new", 4)]), &open);

        assert!(ops.contains(&EpisodeOp::Open {
            full_name: "new".into(),
            detected_at: 3 * DAY,
            failures: 4,
            root_cause_cluster: None,
        }));
        assert!(ops.contains(&EpisodeOp::Touch {
            episode_id: 1,
            seen_at: 3 * DAY,
            days_flaky: 3,
            added_failures: 1,
            root_cause_cluster: None,
        }));
        assert!(ops.contains(&EpisodeOp::Close {
            episode_id: 2,
            fixed_at: 3 * DAY,
            days_flaky: 3,
        }));
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_flaky_flaky_stable_sequence() {
        let conn = conn();

        LifecycleTracker::track(&conn, "p", 0, &suspects(&[("t", 2)])).unwrap();
        let ep = &episodes::open_episodes(&conn, "p").unwrap()[0];
        assert_eq!(ep.first_flaky_detected, 0);
        assert_eq!(ep.days_flaky, 0);

        LifecycleTracker::track(&conn, "p", 2 * DAY, &suspects(&[("t", 3)])).unwrap();
        let ep = &episodes::open_episodes(&conn, "p").unwrap()[0];
        assert_eq!(ep.days_flaky, 2);
        assert_eq!(ep.last_flaky_seen, 2 * DAY);
        assert_eq!(ep.total_failures_while_flaky, 5);

        let summary = LifecycleTracker::track(&conn, "p", 3 * DAY, &suspects(&[])).unwrap();
        assert_eq!(summary.closed, 1);
        assert!(episodes::open_episodes(&conn, "p").unwrap().is_empty());
        let all = episodes::episodes_for_test(&conn, "p", "t").unwrap();
        assert_eq!(all[0].fixed_timestamp, Some(3 * DAY));
        assert_eq!(all[0].days_flaky, 3);
    }

    #[test]
    fn test_replaying_a_run_is_idempotent() {
        let conn = conn();
        let s = suspects(&[("t", 2)]);
        LifecycleTracker::track(&conn, "p", 100, &s).unwrap();
        let first = episodes::episodes_for_test(&conn, "p", "t").unwrap();
        LifecycleTracker::track(&conn, "p", 100, &s).unwrap();
        let second = episodes::episodes_for_test(&conn, "p", "t").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_refixed_test_gets_new_episode() {
        let conn = conn();
        LifecycleTracker::track(&conn, "p", 0, &suspects(&[("t", 1)])).unwrap();
        LifecycleTracker::track(&conn, "p", DAY, &suspects(&[])).unwrap();
        LifecycleTracker::track(&conn, "p", 5 * DAY, &suspects(&[("t", 1)])).unwrap();

        let all = episodes::episodes_for_test(&conn, "p", "t").unwrap();
        assert_eq!(all.len(), 2);
        assert_ne!(all[0].first_flaky_detected, all[1].first_flaky_detected);
        assert_eq!(all[0].fixed_timestamp, Some(DAY));
        assert!(all[1].is_open());
    }

    #[test]
    fn test_failures_never_decrease_while_open() {
        let conn = conn();
        let mut last = 0;
        for (i, fails) in [3, 0, 1, 0, 4].iter().enumerate() {
            LifecycleTracker::track(&conn, "p", i as i64 * DAY, &suspects(&[("t", *fails)]))
                .unwrap();
            let total = episodes::open_episodes(&conn, "p").unwrap()[0].total_failures_while_flaky;
            assert!(total >= last);
            last = total;
        }
        assert_eq!(last, 8);
    }

    #[test]
    fn test_projects_are_tracked_separately() {
        let conn = conn();
        LifecycleTracker::track(&conn, "a", 0, &suspects(&[("t", 1)])).unwrap();
        LifecycleTracker::track(&conn, "b", 0, &suspects(&[])).unwrap();
        assert_eq!(episodes::open_episodes(&conn, "a").unwrap().len(), 1);
    }
}
