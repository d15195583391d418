//! Records passed between the analysis stages.
//!
//! Everything here is a plain, fixed-field value. Executions come in from the
//! parsing layer, statistics/clusters are recomputed on every run, and
//! episodes are the only records that round-trip through the history store.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds in a day, used for `days_flaky`.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Outcome of one test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    #[serde(alias = "pass", alias = "passed", alias = "PASSED")]
    Pass,
    #[serde(alias = "fail", alias = "failed", alias = "FAILED")]
    Fail,
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "skip", alias = "skipped", alias = "SKIPPED")]
    Skip,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Error => "ERROR",
            TestStatus::Skip => "SKIP",
        }
    }

    /// FAIL and ERROR are both counted as failures.
    pub fn is_failure(&self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Error)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pass" | "passed" => Ok(TestStatus::Pass),
            "fail" | "failed" => Ok(TestStatus::Fail),
            "error" => Ok(TestStatus::Error),
            "skip" | "skipped" => Ok(TestStatus::Skip),
            other => Err(format!("unknown test status '{}'", other)),
        }
    }
}

/// One observed run of one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestExecution {
    pub full_name: String,
    pub project: String,
    pub status: TestStatus,
    /// Seconds since the epoch.
    pub timestamp: i64,
    /// Build/run identifier. Grouping only, ordering is by `timestamp`.
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_signature: Option<String>,
    /// Commit the run was built from, recorded on the `runs` row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

impl TestExecution {
    /// Key identifying the test this execution belongs to.
    pub fn test_key(&self) -> TestKey {
        TestKey {
            project: self.project.clone(),
            full_name: self.full_name.clone(),
        }
    }

    /// Failure text, if this is a failing execution with a non-blank signature.
    pub fn failure_text(&self) -> Option<&str> {
        if !self.status.is_failure() {
            return None;
        }
        self.failure_signature
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

/// `(project, full_name)` pair. Ordered by project first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestKey {
    pub project: String,
    pub full_name: String,
}

/// Verdict for one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Stable,
    TrulyFlaky,
    AlwaysFailing,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Stable => "STABLE",
            Classification::TrulyFlaky => "TRULY_FLAKY",
            Classification::AlwaysFailing => "ALWAYS_FAILING",
        }
    }

    /// Suspect tests are tracked by the lifecycle tracker.
    pub fn is_suspect(&self) -> bool {
        matches!(
            self,
            Classification::TrulyFlaky | Classification::AlwaysFailing
        )
    }

    /// Only `TrulyFlaky` is a statistical flakiness claim.
    pub fn is_flaky(&self) -> bool {
        matches!(self, Classification::TrulyFlaky)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-test statistics, recomputed on every analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStatistics {
    pub pass_count: u32,
    /// FAIL + ERROR.
    pub fail_count: u32,
    pub error_count: u32,
    pub skip_count: u32,
    /// pass + fail + error. SKIP excluded.
    pub total: u32,
    pub transition_count: u32,
    pub flake_rate: f64,
    pub confidence: f64,
    pub classification: Classification,
}

impl TestStatistics {
    /// Statistics for a test with no usable observations.
    pub fn empty() -> Self {
        Self {
            pass_count: 0,
            fail_count: 0,
            error_count: 0,
            skip_count: 0,
            total: 0,
            transition_count: 0,
            flake_rate: 0.0,
            confidence: 0.0,
            classification: Classification::Stable,
        }
    }
}

/// Statistics for one test, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub project: String,
    pub full_name: String,
    /// FAIL/ERROR executions of this test in the ingested batch.
    pub failures_this_run: u32,
    pub statistics: TestStatistics,
}

/// One persisted flaky "incident" for a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlakyEpisode {
    pub id: i64,
    pub full_name: String,
    pub project: String,
    pub first_flaky_detected: i64,
    pub last_flaky_seen: i64,
    /// `None` while the episode is open.
    pub fixed_timestamp: Option<i64>,
    pub days_flaky: i64,
    pub total_failures_while_flaky: i64,
    pub root_cause_cluster: Option<String>,
}

impl FlakyEpisode {
    pub fn is_open(&self) -> bool {
        self.fixed_timestamp.is_none()
    }
}

/// Whole days between `since` and `until`, never negative.
pub fn days_between(since: i64, until: i64) -> i64 {
    ((until - since) / SECONDS_PER_DAY).max(0)
}

/// Root-cause taxonomy for failure signatures, in match precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    DatabaseConnectivity,
    Network,
    Timing,
    Resource,
    Auth,
    DataState,
    EnvironmentConfig,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::DatabaseConnectivity => "database_connectivity",
            FailureCategory::Network => "network",
            FailureCategory::Timing => "timing",
            FailureCategory::Resource => "resource",
            FailureCategory::Auth => "auth",
            FailureCategory::DataState => "data_state",
            FailureCategory::EnvironmentConfig => "environment_config",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster severity. Ordering follows severity (`Low < Critical`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Currently-failing tests grouped by root-cause category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCluster {
    pub signature_category: FailureCategory,
    pub tests_affected: BTreeSet<String>,
    pub failure_count: u32,
    pub severity: Severity,
    pub recommendation: String,
    /// Most frequent meaningful words across the cluster's signatures.
    pub common_keywords: Vec<String>,
    /// Most frequent exception class name, e.g. `SQLTimeoutException`.
    pub exception_pattern: Option<String>,
}

/// Everything one analysis invocation hands to the reporting layer.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub analysis_id: Uuid,
    /// Timestamp the lifecycle update was evaluated at.
    pub reference_timestamp: i64,
    /// Sorted by flake rate, highest first.
    pub tests: Vec<TestReport>,
    /// Open episodes, worst offenders (most days flaky) first.
    pub open_episodes: Vec<FlakyEpisode>,
    /// Highest severity first, then by failure count.
    pub clusters: Vec<FailureCluster>,
    /// Enrichment text keyed by test full name.
    pub suggestions: BTreeMap<String, String>,
    /// False when the history store update was rolled back or skipped.
    pub persisted: bool,
    pub warnings: Vec<String>,
}

impl AnalysisResult {
    pub fn flaky_count(&self) -> usize {
        self.tests
            .iter()
            .filter(|t| t.statistics.classification.is_flaky())
            .count()
    }

    pub fn suspect_count(&self) -> usize {
        self.tests
            .iter()
            .filter(|t| t.statistics.classification.is_suspect())
            .count()
    }

    /// Look up the report for one test.
    pub fn test(&self, project: &str, full_name: &str) -> Option<&TestReport> {
        self.tests
            .iter()
            .find(|t| t.project == project && t.full_name == full_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing_accepts_parser_spellings() {
        assert_eq!("pass".parse::<TestStatus>().unwrap(), TestStatus::Pass);
        assert_eq!("SKIPPED".parse::<TestStatus>().unwrap(), TestStatus::Skip);
        assert_eq!("Error".parse::<TestStatus>().unwrap(), TestStatus::Error);
        assert!("flaky".parse::<TestStatus>().is_err());
    }

    #[test]
    fn test_execution_deserializes_lowercase_status() {
        let json = r#"{"full_name":"a.B#c","project":"p","status":"fail",
                       "timestamp":10,"run_id":"r1","failure_signature":"boom"}"#;
        let exec: TestExecution = serde_json::from_str(json).unwrap();
        assert_eq!(exec.status, TestStatus::Fail);
        assert_eq!(exec.failure_text(), Some("boom"));
    }

    #[test]
    fn test_failure_text_ignores_passing_and_blank() {
        let mut exec = TestExecution {
            full_name: "t".into(),
            project: "p".into(),
            status: TestStatus::Pass,
            timestamp: 0,
            run_id: "r".into(),
            failure_signature: Some("stale".into()),
            commit_sha: None,
        };
        assert_eq!(exec.failure_text(), None);
        exec.status = TestStatus::Error;
        exec.failure_signature = Some("   ".into());
        assert_eq!(exec.failure_text(), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_days_between_floors_and_clamps() {
        assert_eq!(days_between(0, SECONDS_PER_DAY * 2 + 5), 2);
        assert_eq!(days_between(100, 50), 0);
    }
}
