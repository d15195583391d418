//! Statistical helpers for the confidence scorer.
//!
//! Each factor is a pure function returning a value in `[0, 1]`; the scorer
//! multiplies them.

use crate::analysis::AnalysisError;

/// Two-sided 95% normal quantile.
pub const Z_95: f64 = 1.959_963_984_540_054;

/// Number of observations at which the sample-size factor saturates.
pub const SAMPLE_SATURATION: u32 = 20;

/// Wilson score interval bounds for a binomial proportion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WilsonInterval {
    pub center: f64,
    pub lower: f64,
    pub upper: f64,
}

impl WilsonInterval {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Distance from the center to either bound.
    pub fn half_width(&self) -> f64 {
        self.width() / 2.0
    }
}

/// Wilson score interval for `successes` out of `total` trials at quantile `z`.
pub fn wilson_interval(successes: u32, total: u32, z: f64) -> Result<WilsonInterval, AnalysisError> {
    if total == 0 {
        return Err(AnalysisError::InsufficientData { needed: 1, have: 0 });
    }
    let n = total as f64;
    let p = successes.min(total) as f64 / n;
    let z2 = z * z;

    let denominator = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denominator;
    let margin = z * ((p * (1.0 - p) + z2 / (4.0 * n)) / n).sqrt() / denominator;

    Ok(WilsonInterval {
        center,
        lower: (center - margin).max(0.0),
        upper: (center + margin).min(1.0),
    })
}

/// Saturates at 1.0 once `total` reaches [`SAMPLE_SATURATION`].
pub fn sample_size_factor(total: u32) -> f64 {
    (total as f64 / SAMPLE_SATURATION as f64).min(1.0)
}

/// How much the test oscillates, relative to the `total - 1` adjacent pairs.
///
/// Independent pass/fail outcomes with failure rate `p` change state on
/// `2p(1-p) <= 0.5` of adjacent pairs, so the ratio is scaled against that
/// ceiling: half the pairs changing already counts as full oscillation.
pub fn transition_factor(transitions: u32, total: u32) -> Result<f64, AnalysisError> {
    if total < 2 {
        return Err(AnalysisError::InsufficientData {
            needed: 2,
            have: total,
        });
    }
    let ratio = transitions as f64 / (total - 1) as f64;
    Ok((ratio * 2.0).clamp(0.0, 1.0))
}

/// Certainty of the observed failure proportion: `1 - half_width` of the
/// 95% Wilson interval.
///
/// This uses the half-width on purpose, not the full `1 - (upper - lower)`.
/// The full width is too strict for realistic windows: 8 failures in 20
/// gives bounds of about (0.219, 0.613), so the full-width factor caps at
/// about 0.605 and a 20-run history with 10 transitions could never reach a
/// 0.7 confidence threshold. The half-width gives about 0.803 for the same
/// window.
pub fn interval_width_factor(fail_count: u32, total: u32) -> Result<f64, AnalysisError> {
    let interval = wilson_interval(fail_count, total, Z_95)?;
    Ok((1.0 - interval.half_width()).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wilson_interval_known_values() {
        // 8 failures in 20: center ~0.416, bounds ~(0.219, 0.613)
        let wi = wilson_interval(8, 20, Z_95).unwrap();
        assert!((wi.center - 0.4161).abs() < 1e-3, "{:?}", wi);
        assert!((wi.lower - 0.2188).abs() < 1e-3, "{:?}", wi);
        assert!((wi.upper - 0.6134).abs() < 1e-3, "{:?}", wi);
    }

    #[test]
    fn test_wilson_interval_stays_in_unit_range() {
        for fails in 0..=5 {
            let wi = wilson_interval(fails, 5, Z_95).unwrap();
            assert!(wi.lower >= 0.0 && wi.upper <= 1.0);
            assert!(wi.lower <= wi.center && wi.center <= wi.upper);
        }
    }

    #[test]
    fn test_wilson_interval_narrows_with_samples() {
        let small = wilson_interval(2, 5, Z_95).unwrap();
        let large = wilson_interval(40, 100, Z_95).unwrap();
        assert!(large.width() < small.width());
    }

    #[test]
    fn test_wilson_interval_empty_is_insufficient() {
        assert!(matches!(
            wilson_interval(0, 0, Z_95),
            Err(AnalysisError::InsufficientData { have: 0, .. })
        ));
    }

    #[test]
    fn test_sample_size_factor_saturates() {
        assert_eq!(sample_size_factor(0), 0.0);
        assert!((sample_size_factor(5) - 0.25).abs() < f64::EPSILON);
        assert_eq!(sample_size_factor(20), 1.0);
        assert_eq!(sample_size_factor(500), 1.0);
    }

    #[test]
    fn test_transition_factor() {
        assert_eq!(transition_factor(0, 10).unwrap(), 0.0);
        // 10 of 19 pairs changed -> above the 0.5 ceiling
        assert_eq!(transition_factor(10, 20).unwrap(), 1.0);
        assert!((transition_factor(2, 21).unwrap() - 0.2).abs() < 1e-9);
        assert!(transition_factor(0, 1).is_err());
    }

    #[test]
    fn test_interval_width_factor_grows_with_samples() {
        let few = interval_width_factor(2, 5).unwrap();
        let many = interval_width_factor(80, 200).unwrap();
        assert!(many > few);
        assert!(many <= 1.0 && few >= 0.0);
    }

    #[test]
    fn test_interval_width_factor_uses_half_width() {
        let wi = wilson_interval(8, 20, Z_95).unwrap();
        let factor = interval_width_factor(8, 20).unwrap();
        assert!((factor - 0.803).abs() < 1e-3, "{}", factor);
        assert!((factor - (1.0 - wi.half_width())).abs() < 1e-12);
        // full width would leave no room above a 0.7 threshold
        assert!(1.0 - (wi.upper - wi.lower) < 0.7);
    }
}
