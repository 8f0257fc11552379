//! Mean and Student's-t confidence interval over timing samples.
//!
//! Sample counts per condition are small (10 to 50 runs), so the half-width
//! uses the two-tailed t critical value with `n - 1` degrees of freedom
//! rather than a normal approximation.

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use thiserror::Error;

/// Confidence level used when none is configured
pub const DEFAULT_CONFIDENCE: f64 = 0.95;

/// Errors reducing a sample set
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StatsError {
    #[error("need at least 2 samples for a confidence interval, got {0}")]
    InsufficientData(usize),
    #[error("confidence level must be strictly between 0 and 1, got {0}")]
    InvalidConfidence(f64),
    #[error("sample {index} is not finite: {value}")]
    NonFinite { index: usize, value: f64 },
    #[error("t distribution unavailable: {0}")]
    Distribution(String),
}

/// Mean with lower and upper confidence bounds, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryStatistic {
    pub mean: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl SummaryStatistic {
    /// Distance from the mean down to the lower bound
    pub fn lower_error(&self) -> f64 {
        self.mean - self.lower_bound
    }

    /// Distance from the mean up to the upper bound
    pub fn upper_error(&self) -> f64 {
        self.upper_bound - self.mean
    }

    pub fn width(&self) -> f64 {
        self.upper_bound - self.lower_bound
    }
}

/// Reduce `samples` to `(mean, mean - h, mean + h)`.
///
/// `h = se * t((1 + confidence) / 2, n - 1)` where `se` is the standard error
/// of the mean using the `n - 1` sample variance.
pub fn summarize(samples: &[f64], confidence: f64) -> Result<SummaryStatistic, StatsError> {
    let n = samples.len();
    if n < 2 {
        return Err(StatsError::InsufficientData(n));
    }
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(StatsError::InvalidConfidence(confidence));
    }
    if let Some((index, &value)) = samples.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(StatsError::NonFinite { index, value });
    }

    // Exact bounds for a constant series; summing would introduce rounding.
    let first = samples[0];
    if samples.iter().all(|&v| v == first) {
        return Ok(SummaryStatistic {
            mean: first,
            lower_bound: first,
            upper_bound: first,
        });
    }

    let count = n as f64;
    let mean = samples.iter().sum::<f64>() / count;
    let variance = samples
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / (count - 1.0);
    let se = variance.sqrt() / count.sqrt();
    let half = se * t_critical(confidence, n - 1)?;

    Ok(SummaryStatistic {
        mean,
        lower_bound: mean - half,
        upper_bound: mean + half,
    })
}

/// Two-tailed critical value of Student's t for `confidence` and `df`
fn t_critical(confidence: f64, df: usize) -> Result<f64, StatsError> {
    let dist = StudentsT::new(0.0, 1.0, df as f64)
        .map_err(|e| StatsError::Distribution(e.to_string()))?;
    Ok(dist.inverse_cdf((1.0 + confidence) / 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TIMES: [f64; 8] = [0.112, 0.098, 0.105, 0.121, 0.101, 0.117, 0.094, 0.109];

    #[test]
    fn test_rejects_too_few_samples() {
        assert_eq!(
            summarize(&[], DEFAULT_CONFIDENCE),
            Err(StatsError::InsufficientData(0))
        );
        assert_eq!(
            summarize(&[1.5], DEFAULT_CONFIDENCE),
            Err(StatsError::InsufficientData(1))
        );
    }

    #[test]
    fn test_rejects_bad_confidence() {
        for c in [0.0, 1.0, -0.5, 1.5, f64::NAN] {
            assert!(matches!(
                summarize(&TIMES, c),
                Err(StatsError::InvalidConfidence(_))
            ));
        }
    }

    #[test]
    fn test_rejects_non_finite_sample() {
        assert_eq!(
            summarize(&[1.0, f64::INFINITY, 2.0], DEFAULT_CONFIDENCE),
            Err(StatsError::NonFinite {
                index: 1,
                value: f64::INFINITY
            })
        );
    }

    #[test]
    fn test_identical_samples_collapse() {
        let summary = summarize(&[1.0, 1.0, 1.0, 1.0], DEFAULT_CONFIDENCE).unwrap();
        assert_eq!(summary.mean, 1.0);
        assert_eq!(summary.lower_bound, 1.0);
        assert_eq!(summary.upper_bound, 1.0);

        let summary = summarize(&[0.1; 7], 0.99).unwrap();
        assert_eq!(summary.lower_bound, summary.upper_bound);
        assert_eq!(summary.mean, 0.1);
    }

    #[test]
    fn test_known_interval() {
        // mean 2.5, sd 1.2909944, se 0.6454972, t(0.975, 3) = 3.1824463
        let summary = summarize(&[1.0, 2.0, 3.0, 4.0], 0.95).unwrap();
        assert!((summary.mean - 2.5).abs() < 1e-12);
        let half = 0.645_497_224_367_903 * 3.182_446_305_284_263;
        assert!((summary.upper_bound - (2.5 + half)).abs() < 1e-4);
        assert!((summary.lower_bound - (2.5 - half)).abs() < 1e-4);
    }

    #[test]
    fn test_two_samples() {
        // df = 1, t(0.975, 1) = 12.7062047
        let summary = summarize(&[1.0, 3.0], 0.95).unwrap();
        assert!((summary.mean - 2.0).abs() < 1e-12);
        assert!((summary.upper_error() - 12.706_204_736).abs() < 1e-3);
    }

    #[test]
    fn test_error_magnitudes_are_symmetric() {
        let summary = summarize(&TIMES, DEFAULT_CONFIDENCE).unwrap();
        assert!((summary.lower_error() - summary.upper_error()).abs() < 1e-12);
        assert!((summary.width() - 2.0 * summary.upper_error()).abs() < 1e-12);
    }

    #[test]
    fn test_higher_confidence_is_wider() {
        let narrow = summarize(&TIMES, 0.95).unwrap();
        let wide = summarize(&TIMES, 0.99).unwrap();
        assert!(wide.width() > narrow.width());
        assert_eq!(wide.mean, narrow.mean);
    }

    #[test]
    fn test_deterministic() {
        let a = summarize(&TIMES, 0.9).unwrap();
        let b = summarize(&TIMES, 0.9).unwrap();
        assert_eq!(a.mean.to_bits(), b.mean.to_bits());
        assert_eq!(a.lower_bound.to_bits(), b.lower_bound.to_bits());
        assert_eq!(a.upper_bound.to_bits(), b.upper_bound.to_bits());
    }

    proptest! {
        #[test]
        fn prop_bounds_are_ordered(
            samples in prop::collection::vec(0.0f64..100.0, 2..60),
            confidence in 0.5f64..0.999,
        ) {
            let s = summarize(&samples, confidence).unwrap();
            prop_assert!(s.lower_bound <= s.mean);
            prop_assert!(s.mean <= s.upper_bound);
        }

        #[test]
        fn prop_confidence_widens_interval(
            samples in prop::collection::vec(0.0f64..10.0, 3..40),
        ) {
            prop_assume!(samples.iter().any(|&v| v != samples[0]));
            let narrow = summarize(&samples, 0.95).unwrap();
            let wide = summarize(&samples, 0.99).unwrap();
            prop_assert!(wide.width() > narrow.width());
        }
    }
}
