//! Flakiness classification, lifecycle tracking, and failure clustering.

pub mod aggregator;
pub mod cluster;
pub mod enrich;
pub mod lifecycle;
pub mod model;
pub mod runner;
pub mod scorer;
pub mod stats;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Too few observations to make a claim. Recovered as STABLE / confidence 0.
    #[error("insufficient data: need {needed} observations, have {have}")]
    InsufficientData { needed: u32, have: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// History store unreachable or the run's transaction aborted.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("enrichment unavailable: {0}")]
    EnrichmentUnavailable(String),
}

impl AnalysisError {
    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        AnalysisError::PersistenceFailure(format!("{:#}", err))
    }
}
