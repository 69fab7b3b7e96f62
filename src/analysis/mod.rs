//! C4 — Trend Analyzer: turns a window of raw samples into the statistics
//! C6 needs to propose a limit (moving average, percentile, peak, trend
//! slope) plus the spike decoration handed down from C5.

use chrono::{DateTime, Utc};

use crate::collector::{Sample, TrackedMetric};
use crate::config::AnalysisConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisResult {
    pub current_value: f64,
    pub moving_average: Option<f64>,
    pub percentile: f64,
    pub peak: Option<f64>,
    pub trend_slope: f64,
    pub spike_active: bool,
    pub spike_multiplier: f64,
    pub recommended_value: f64,
    pub computed_at: DateTime<Utc>,
}

/// Arithmetic mean of the window, or `None` if empty (there is nothing to
/// average and the caller should skip this tenant/metric for this tick).
pub fn moving_average(samples: &[Sample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let sum: f64 = samples.iter().map(|s| s.value).sum();
    Some(sum / samples.len() as f64)
}

/// Linear-interpolated percentile (nearest-rank with interpolation between
/// the two bracketing order statistics), matching the common definition used
/// by most monitoring systems. `p` is in `[0, 100]`.
pub fn percentile(samples: &[Sample], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if values.len() == 1 {
        return values[0];
    }
    let rank = (p / 100.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return values[lower];
    }
    let frac = rank - lower as f64;
    values[lower] + frac * (values[upper] - values[lower])
}

pub fn peak(samples: &[Sample]) -> Option<f64> {
    samples
        .iter()
        .map(|s| s.value)
        .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
}

/// Ordinary-least-squares slope of value against elapsed seconds since the
/// first sample. Undefined (returns 0.0) for fewer than two samples — a
/// trend needs at least two points to exist.
pub fn trend_slope(samples: &[Sample]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let t0 = samples[0].timestamp;
    let xs: Vec<f64> = samples
        .iter()
        .map(|s| (s.timestamp - t0).num_milliseconds() as f64 / 1000.0)
        .collect();
    let ys: Vec<f64> = samples.iter().map(|s| s.value).collect();

    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for i in 0..xs.len() {
        let dx = xs[i] - mean_x;
        numerator += dx * (ys[i] - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        return 0.0;
    }
    numerator / denominator
}

/// Combine the window statistics into one recommendation, applying the
/// spike multiplier last so it scales the already-buffered recommendation
/// rather than the raw inputs.
pub fn analyze(
    samples: &[Sample],
    config: &AnalysisConfig,
    spike_active: bool,
    spike_multiplier: f64,
    now: DateTime<Utc>,
) -> Option<AnalysisResult> {
    if samples.is_empty() {
        return None;
    }

    let avg = if config.use_moving_average {
        moving_average(samples)
    } else {
        None
    };
    let pct = percentile(samples, config.percentile);
    let pk = if config.include_peaks { peak(samples) } else { None };
    let slope = trend_slope(samples);
    let current_value = samples.last().map(|s| s.value).unwrap_or(0.0);

    let mut base = pct;
    if let Some(avg) = avg {
        base = base.max(avg);
    }
    if let Some(pk) = pk {
        base = base.max(pk * 0.8);
    }

    Some(AnalysisResult {
        current_value,
        moving_average: avg,
        percentile: pct,
        peak: pk,
        trend_slope: slope,
        spike_active,
        spike_multiplier,
        recommended_value: base * spike_multiplier,
        computed_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_at(value: f64, seconds_offset: i64, base: DateTime<Utc>) -> Sample {
        Sample {
            tenant: "t1".to_string(),
            metric: TrackedMetric::DistributorReceivedSamples,
            value,
            timestamp: base + chrono::Duration::seconds(seconds_offset),
            source: "test".to_string(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn moving_average_of_empty_window_is_none() {
        assert_eq!(moving_average(&[]), None);
    }

    #[test]
    fn percentile_single_sample_returns_that_value() {
        let base = Utc::now();
        let samples = vec![sample_at(42.0, 0, base)];
        assert_eq!(percentile(&samples, 95.0), 42.0);
    }

    #[test]
    fn percentile_interpolates_between_order_statistics() {
        let base = Utc::now();
        let samples: Vec<Sample> = (0..=10).map(|i| sample_at(i as f64, i, base)).collect();
        let p50 = percentile(&samples, 50.0);
        assert!((p50 - 5.0).abs() < 1e-9);
    }

    #[test]
    fn trend_slope_needs_at_least_two_samples() {
        let base = Utc::now();
        assert_eq!(trend_slope(&[sample_at(1.0, 0, base)]), 0.0);
        assert_eq!(trend_slope(&[]), 0.0);
    }

    #[test]
    fn trend_slope_is_positive_for_rising_series() {
        let base = Utc::now();
        let samples = vec![
            sample_at(10.0, 0, base),
            sample_at(20.0, 60, base),
            sample_at(30.0, 120, base),
        ];
        assert!(trend_slope(&samples) > 0.0);
    }

    #[test]
    fn analyze_applies_spike_multiplier_last() {
        let base = Utc::now();
        let samples = vec![sample_at(100.0, 0, base), sample_at(100.0, 60, base)];
        let config = AnalysisConfig {
            analysis_window: std::time::Duration::from_secs(3600),
            percentile: 95.0,
            use_moving_average: true,
            include_peaks: true,
        };
        let result = analyze(&samples, &config, true, 2.0, base).unwrap();
        assert_eq!(result.recommended_value, 200.0);
        assert!(result.spike_active);
    }

    #[test]
    fn analyze_on_empty_window_is_none() {
        let config = AnalysisConfig {
            analysis_window: std::time::Duration::from_secs(3600),
            percentile: 95.0,
            use_moving_average: true,
            include_peaks: true,
        };
        assert!(analyze(&[], &config, false, 1.0, Utc::now()).is_none());
    }
}
