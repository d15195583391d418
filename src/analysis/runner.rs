//! End-to-end analysis of one ingested batch.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::aggregator::RunAggregator;
use crate::analysis::cluster;
use crate::analysis::enrich::{self, NoopSuggester, Suggester};
use crate::analysis::lifecycle::{LifecycleTracker, SuspectTest};
use crate::analysis::model::{
    AnalysisResult, FailureCategory, FlakyEpisode, TestExecution, TestKey, TestReport,
    TestStatistics,
};
use crate::analysis::scorer::ConfidenceScorer;
use crate::analysis::AnalysisError;
use crate::config::AnalysisConfig;
use crate::storage::{episodes, executions, HistoryStore};

static NOOP: NoopSuggester = NoopSuggester;

/// Configured pipeline. Cheap to build, one per analysis request.
pub struct FlakinessAnalyzer<'a> {
    config: AnalysisConfig,
    scorer: ConfidenceScorer,
    store: Option<&'a HistoryStore>,
    suggester: &'a dyn Suggester,
}

impl<'a> FlakinessAnalyzer<'a> {
    /// Validates `config` up front; nothing runs on a bad configuration.
    pub fn new(config: AnalysisConfig) -> Result<Self, AnalysisError> {
        config.validate()?;
        let scorer = ConfidenceScorer::new(config.confidence_threshold)?;
        Ok(Self {
            config,
            scorer,
            store: None,
            suggester: &NOOP,
        })
    }

    pub fn with_store(mut self, store: &'a HistoryStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_suggester(mut self, suggester: &'a dyn Suggester) -> Self {
        self.suggester = suggester;
        self
    }

    /// Run the full pipeline:
    /// 1. Drop duplicate `(full_name, project, run_id)` rows
    /// 2. Cluster this run's failures
    /// 3. In one transaction: record the batch, score every test over its
    ///    stored window, update flaky episodes
    /// 4. On a store error, score the batch alone and report `persisted = false`
    /// 5. Read back open episodes and ask the suggester about failing tests
    pub async fn run(&self, batch: Vec<TestExecution>) -> AnalysisResult {
        let mut warnings = Vec::new();
        let batch = dedupe(batch, &mut warnings);
        let reference_ts = batch
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or_else(|| Utc::now().timestamp());
        let projects: BTreeSet<&str> = batch.iter().map(|e| e.project.as_str()).collect();

        info!(
            executions = batch.len(),
            projects = projects.len(),
            reference_ts,
            "Starting flakiness analysis"
        );

        let categories = cluster::assign_categories(&batch);
        let clusters = cluster::cluster_failures(&batch);
        let failures = failures_this_run(&batch);

        let (statistics, persisted) = match self.store {
            Some(store) => {
                match self.score_and_track(store, &batch, reference_ts, &failures, &categories) {
                    Ok(stats) => (stats, true),
                    Err(e) => {
                        warn!(error = %e, "History update rolled back, scoring this batch only");
                        warnings.push(e.to_string());
                        (self.score_batch(&batch), false)
                    }
                }
            }
            None => {
                debug!("no history store attached");
                warnings.push("no history store attached; results not persisted".to_string());
                (self.score_batch(&batch), false)
            }
        };

        let open_episodes = match self.store {
            Some(store) => load_open_episodes(store, &projects, reference_ts, &mut warnings),
            None => Vec::new(),
        };

        let mut tests: Vec<TestReport> = statistics
            .into_iter()
            .map(|(key, statistics)| TestReport {
                failures_this_run: failures.get(&key).copied().unwrap_or(0),
                project: key.project,
                full_name: key.full_name,
                statistics,
            })
            .collect();
        tests.sort_by(|a, b| {
            b.statistics
                .flake_rate
                .total_cmp(&a.statistics.flake_rate)
                .then_with(|| a.project.cmp(&b.project))
                .then_with(|| a.full_name.cmp(&b.full_name))
        });

        let suggestions =
            enrich::enrich_failures(self.suggester, &tests, &batch, self.config.max_ai_analysis)
                .await;

        let result = AnalysisResult {
            analysis_id: Uuid::new_v4(),
            reference_timestamp: reference_ts,
            tests,
            open_episodes,
            clusters,
            suggestions,
            persisted,
            warnings,
        };
        info!(
            analysis_id = %result.analysis_id,
            tests = result.tests.len(),
            flaky = result.flaky_count(),
            suspect = result.suspect_count(),
            clusters = result.clusters.len(),
            persisted = result.persisted,
            "Analysis complete"
        );
        result
    }

    /// Everything that touches the store, as one IMMEDIATE transaction.
    fn score_and_track(
        &self,
        store: &HistoryStore,
        batch: &[TestExecution],
        reference_ts: i64,
        failures: &BTreeMap<TestKey, u32>,
        categories: &BTreeMap<TestKey, FailureCategory>,
    ) -> Result<BTreeMap<TestKey, TestStatistics>, AnalysisError> {
        let limit = self.config.limit_runs;

        store
            .write_transaction(|tx| {
                let inserted = executions::insert_batch(tx, batch)?;
                debug!(inserted, "executions recorded");

                let mut keys: BTreeSet<TestKey> = batch.iter().map(TestExecution::test_key).collect();
                let projects: BTreeSet<String> = keys.iter().map(|k| k.project.clone()).collect();

                // Tests absent from this batch but still open must be re-scored
                // so they can close.
                for project in &projects {
                    for ep in episodes::open_episodes(tx, project)? {
                        keys.insert(TestKey {
                            project: ep.project,
                            full_name: ep.full_name,
                        });
                    }
                }

                let mut stats = BTreeMap::new();
                for key in keys {
                    let window = executions::fetch_window(tx, &key.project, &key.full_name, limit)?;
                    let s = self.scorer.score(&RunAggregator::aggregate(&window, limit));
                    debug!(
                        project = %key.project,
                        test = %key.full_name,
                        total = s.total,
                        confidence = s.confidence,
                        classification = %s.classification,
                        "test scored"
                    );
                    stats.insert(key, s);
                }

                if self.config.track_time_to_fix {
                    for project in &projects {
                        let suspects = suspects_for(project, &stats, failures, categories);
                        LifecycleTracker::track(tx, project, reference_ts, &suspects)?;
                    }
                }

                Ok(stats)
            })
            .map_err(AnalysisError::persistence)
    }

    /// Statistics from the batch alone, used when history is unavailable.
    fn score_batch(&self, batch: &[TestExecution]) -> BTreeMap<TestKey, TestStatistics> {
        let mut grouped: BTreeMap<TestKey, Vec<TestExecution>> = BTreeMap::new();
        for e in batch {
            grouped.entry(e.test_key()).or_default().push(e.clone());
        }
        grouped
            .into_iter()
            .map(|(key, window)| {
                let counts = RunAggregator::aggregate(&window, self.config.limit_runs);
                (key, self.scorer.score(&counts))
            })
            .collect()
    }
}

/// Keep the first execution of every `(full_name, project, run_id)`.
fn dedupe(batch: Vec<TestExecution>, warnings: &mut Vec<String>) -> Vec<TestExecution> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(batch.len());
    let mut dropped = 0usize;
    for e in batch {
        if seen.insert((e.project.clone(), e.full_name.clone(), e.run_id.clone())) {
            kept.push(e);
        } else {
            dropped += 1;
        }
    }
    if dropped > 0 {
        warn!(dropped, "Duplicate executions in batch ignored");
        warnings.push(format!(
            "ignored {} duplicate execution(s) sharing test and run_id",
            dropped
        ));
    }
    kept
}

fn failures_this_run(batch: &[TestExecution]) -> BTreeMap<TestKey, u32> {
    let mut failures = BTreeMap::new();
    for e in batch.iter().filter(|e| e.status.is_failure()) {
        *failures.entry(e.test_key()).or_insert(0) += 1;
    }
    failures
}

fn suspects_for(
    project: &str,
    stats: &BTreeMap<TestKey, TestStatistics>,
    failures: &BTreeMap<TestKey, u32>,
    categories: &BTreeMap<TestKey, FailureCategory>,
) -> BTreeMap<String, SuspectTest> {
    stats
        .iter()
        .filter(|(key, s)| key.project == project && s.classification.is_suspect())
        .map(|(key, _)| {
            (
                key.full_name.clone(),
                SuspectTest {
                    failures_this_run: failures.get(key).copied().unwrap_or(0) as i64,
                    root_cause_cluster: categories.get(key).map(|c| c.as_str().to_string()),
                },
            )
        })
        .collect()
}

fn load_open_episodes(
    store: &HistoryStore,
    projects: &BTreeSet<&str>,
    reference_ts: i64,
    warnings: &mut Vec<String>,
) -> Vec<FlakyEpisode> {
    let mut open = Vec::new();
    for project in projects {
        match store.open_episodes(project, reference_ts) {
            Ok(eps) => open.extend(eps),
            Err(e) => {
                warn!(%project, error = %e, "Failed to read open episodes");
                warnings.push(format!("open episodes for {} unavailable: {:#}", project, e));
            }
        }
    }
    episodes::rank_worst_first(&mut open);
    open
}
