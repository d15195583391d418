//! FlakeRadar -- flaky test classification and time-to-fix tracking.
//!
//! This crate provides the core library for scoring test execution history,
//! tracking flaky episodes in a SQLite history store, and clustering failures
//! by likely root cause.

pub mod analysis;
pub mod config;
pub mod storage;

use analysis::model::{AnalysisResult, TestExecution};
use analysis::runner::FlakinessAnalyzer;
use analysis::AnalysisError;
use config::AnalysisConfig;
use storage::HistoryStore;

/// Analyze one batch with the default (no-op) suggester.
///
/// Only an invalid configuration is an error; store failures come back as
/// `persisted = false` with a warning.
pub async fn analyze(
    batch: Vec<TestExecution>,
    config: AnalysisConfig,
    store: Option<&HistoryStore>,
) -> Result<AnalysisResult, AnalysisError> {
    let mut analyzer = FlakinessAnalyzer::new(config)?;
    if let Some(store) = store {
        analyzer = analyzer.with_store(store);
    }
    Ok(analyzer.run(batch).await)
}
