//! Confidence scoring and classification.
//!
//! `confidence = sample_size × transition × interval_width`, with the
//! single-outcome cases (never failed, never passed) pinned to zero before the
//! formula is consulted.

use crate::analysis::aggregator::RunCounts;
use crate::analysis::model::{Classification, TestStatistics};
use crate::analysis::stats;
use crate::analysis::AnalysisError;

/// Default minimum confidence for a `TRULY_FLAKY` verdict.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Minimum observations before an all-failing test is `ALWAYS_FAILING`.
pub const MIN_ALWAYS_FAILING_RUNS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceScorer {
    threshold: f64,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl ConfidenceScorer {
    pub fn new(threshold: f64) -> Result<Self, AnalysisError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(AnalysisError::InvalidConfiguration(format!(
                "confidence_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Confidence in `[0, 1]` that the counted test is genuinely flaky.
    pub fn confidence(counts: &RunCounts) -> f64 {
        if counts.pass_count == 0 || counts.fail_count == 0 {
            return 0.0;
        }
        match Self::combined_factors(counts) {
            Ok(c) => c.clamp(0.0, 1.0),
            Err(AnalysisError::InsufficientData { needed, have }) => {
                tracing::trace!(needed, have, "not enough observations to score");
                0.0
            }
            Err(_) => 0.0,
        }
    }

    fn combined_factors(counts: &RunCounts) -> Result<f64, AnalysisError> {
        let sample = stats::sample_size_factor(counts.total);
        let transition = stats::transition_factor(counts.transition_count, counts.total)?;
        let interval = stats::interval_width_factor(counts.fail_count, counts.total)?;
        Ok(sample * transition * interval)
    }

    pub fn classify(&self, counts: &RunCounts, confidence: f64) -> Classification {
        if counts.pass_count > 0 && counts.fail_count > 0 && confidence >= self.threshold {
            Classification::TrulyFlaky
        } else if counts.fail_count > 0
            && counts.pass_count == 0
            && counts.total >= MIN_ALWAYS_FAILING_RUNS
        {
            Classification::AlwaysFailing
        } else {
            Classification::Stable
        }
    }

    /// Score and classify in one step.
    pub fn score(&self, counts: &RunCounts) -> TestStatistics {
        let confidence = Self::confidence(counts);
        TestStatistics {
            pass_count: counts.pass_count,
            fail_count: counts.fail_count,
            error_count: counts.error_count,
            skip_count: counts.skip_count,
            total: counts.total,
            transition_count: counts.transition_count,
            flake_rate: counts.flake_rate(),
            confidence,
            classification: self.classify(counts, confidence),
        }
    }
}
