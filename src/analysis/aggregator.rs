use crate::analysis::model::{TestExecution, TestStatus};

/// Default number of most-recent executions considered per test.
pub const DEFAULT_LIMIT_RUNS: usize = 50;

/// Raw counters for one test over its analysis window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub pass_count: u32,
    /// FAIL + ERROR.
    pub fail_count: u32,
    pub error_count: u32,
    pub skip_count: u32,
    pub total: u32,
    pub transition_count: u32,
}

impl RunCounts {
    pub fn flake_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.fail_count as f64 / self.total as f64
        }
    }
}

/// Reduce a window of executions for one `(full_name, project)` into counters.
pub struct RunAggregator;

impl RunAggregator {
    /// Aggregate the most recent `limit_runs` executions.
    ///
    /// Executions are ordered by timestamp here (stable, so equal timestamps
    /// keep their input order); callers don't need to pre-sort.
    pub fn aggregate(executions: &[TestExecution], limit_runs: usize) -> RunCounts {
        let mut ordered: Vec<&TestExecution> = executions.iter().collect();
        ordered.sort_by_key(|e| e.timestamp);

        let start = ordered.len().saturating_sub(limit_runs.max(1));
        Self::count(ordered[start..].iter().map(|e| e.status))
    }

    /// Count outcomes of an already-ordered status sequence.
    pub fn count<I>(statuses: I) -> RunCounts
    where
        I: IntoIterator<Item = TestStatus>,
    {
        let mut counts = RunCounts::default();
        // Previous non-skipped outcome, `true` for failure-like.
        let mut previous: Option<bool> = None;

        for status in statuses {
            let failed = match status {
                TestStatus::Skip => {
                    counts.skip_count += 1;
                    continue;
                }
                TestStatus::Pass => {
                    counts.pass_count += 1;
                    false
                }
                TestStatus::Fail => {
                    counts.fail_count += 1;
                    true
                }
                TestStatus::Error => {
                    counts.fail_count += 1;
                    counts.error_count += 1;
                    true
                }
            };
            counts.total += 1;

            if let Some(prev) = previous {
                if prev != failed {
                    counts.transition_count += 1;
                }
            }
            previous = Some(failed);
        }

        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TestStatus::*;

    fn exec(ts: i64, status: TestStatus) -> TestExecution {
        TestExecution {
            full_name: "suite.Test#case".into(),
            project: "proj".into(),
            status,
            timestamp: ts,
            run_id: format!("run-{}", ts),
            failure_signature: None,
            commit_sha: None,
        }
    }

    #[test]
    fn test_empty_input_is_all_zero() {
        let counts = RunAggregator::aggregate(&[], DEFAULT_LIMIT_RUNS);
        assert_eq!(counts, RunCounts::default());
        assert_eq!(counts.flake_rate(), 0.0);
    }

    #[test]
    fn test_error_is_failure_like() {
        // PASS -> ERROR -> FAIL: one transition, FAIL/ERROR are the same side
        let counts = RunAggregator::count([Pass, Error, Fail]);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.fail_count, 2);
        assert_eq!(counts.error_count, 1);
        assert_eq!(counts.transition_count, 1);
    }

    #[test]
    fn test_skip_neither_counts_nor_breaks_transition() {
        let counts = RunAggregator::count([Pass, Skip, Fail, Skip, Skip, Fail]);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.skip_count, 3);
        assert_eq!(counts.transition_count, 1);

        // A skip between identical outcomes doesn't create a transition
        let counts = RunAggregator::count([Fail, Skip, Fail]);
        assert_eq!(counts.transition_count, 0);
    }

    #[test]
    fn test_transitions_are_order_sensitive() {
        // Same failure rate (1/3), different oscillation
        let every_third = RunAggregator::count([Pass, Pass, Fail, Pass, Pass, Fail]);
        let grouped = RunAggregator::count([Pass, Pass, Pass, Pass, Fail, Fail]);
        assert_eq!(every_third.fail_count, grouped.fail_count);
        assert_eq!(every_third.transition_count, 3);
        assert_eq!(grouped.transition_count, 1);
    }

    #[test]
    fn test_aggregate_sorts_by_timestamp() {
        let execs = vec![exec(30, Fail), exec(10, Pass), exec(20, Pass)];
        let counts = RunAggregator::aggregate(&execs, DEFAULT_LIMIT_RUNS);
        assert_eq!(counts.transition_count, 1);
    }

    #[test]
    fn test_aggregate_keeps_most_recent_window() {
        // Old failures fall outside a window of 3
        let execs = vec![
            exec(1, Fail),
            exec(2, Fail),
            exec(3, Pass),
            exec(4, Pass),
            exec(5, Pass),
        ];
        let counts = RunAggregator::aggregate(&execs, 3);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.fail_count, 0);
        assert_eq!(counts.transition_count, 0);
    }
}
