//! C6 — Limit Calculator: maps analyzer output onto the five tunable
//! override fields, applies buffer headroom and tier/global bounds, and
//! restores the burst >= rate invariant after clamping. Pure computation —
//! no I/O beyond stamping a last-updated timestamp.

use chrono::{DateTime, Utc};
use log::warn;

use crate::analysis::AnalysisResult;
use crate::config::{LimitBounds, LimitsConfig};

/// §3 "source tag": which path produced this tenant's record, for the audit
/// trail only — never written to the published artifact itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    /// At least one field was derived from this tick's analyzer output.
    Analyzer,
    /// A tenant tier's bounds or buffer shaped this record.
    Tier,
    /// No analyzer input this tick; the record reflects clamps/carry-forward only.
    Default,
}

impl LimitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitSource::Analyzer => "analyzer",
            LimitSource::Tier => "tier",
            LimitSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TenantLimits {
    pub ingestion_rate: Option<f64>,
    pub ingestion_burst_size: Option<f64>,
    pub max_global_series_per_user: Option<f64>,
    pub max_samples_per_query: Option<f64>,
    pub max_query_lookback_secs: Option<f64>,
    pub source: LimitSource,
    pub reason: String,
    pub computed_at: DateTime<Utc>,
}

/// Which analyzer result feeds which override field (§4.6 mapping rules).
/// `received_samples` drives the ingestion rate/burst pair; `memory_series`
/// drives the max series ceiling; `query_volume` (querier or query-frontend,
/// whichever was observed) drives the per-query sample ceiling.
pub struct AnalysisInputs {
    pub received_samples: Option<AnalysisResult>,
    pub memory_series: Option<AnalysisResult>,
    pub query_volume: Option<AnalysisResult>,
}

/// The derived-limit side of the §4.6 mapping table, carried across ticks so
/// `max(existing, recommended)` has an `existing` to compare against. These
/// are pre-buffer, pre-clamp values: comparing against the *published*
/// (buffered, clamped) limit would ratchet every field upward forever as
/// each tick re-buffers an already-buffered number.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviousTargets {
    pub ingestion_rate: Option<f64>,
    pub ingestion_burst: Option<f64>,
    pub max_series: Option<f64>,
    pub max_samples_per_query: Option<f64>,
}

/// Result of one `compute()` call: the published-shape record, the raw
/// targets to remember as next tick's `PreviousTargets`, and any clamp-bug
/// warnings (configured min > max for a field) for the caller to audit.
pub struct ComputeOutcome {
    pub limits: TenantLimits,
    pub raw_targets: PreviousTargets,
    pub clamp_warnings: Vec<String>,
}

fn apply_buffer(value: f64, buffer_percent: f64) -> f64 {
    value * (1.0 + buffer_percent / 100.0)
}

/// `max(existing, candidate)`, treating a missing `existing` as "no floor yet".
fn merge_existing(existing: Option<f64>, candidate: f64) -> f64 {
    existing.map_or(candidate, |e| e.max(candidate))
}

fn clamp(value: f64, min: Option<f64>, max: Option<f64>, field: &str, warnings: &mut Vec<String>) -> f64 {
    let mut clamped = value;
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            let msg = format!(
                "limit field '{field}': configured min ({min}) exceeds max ({max}); using max for both bounds"
            );
            warn!("{msg}");
            warnings.push(msg);
            return max;
        }
    }
    if let Some(min) = min {
        clamped = clamped.max(min);
    }
    if let Some(max) = max {
        clamped = clamped.min(max);
    }
    clamped
}

/// Compute the final bounds to apply for one tenant, given which bounds
/// (tier-specific or global) and buffer percentage apply, and the raw
/// targets this same tenant carried out of the previous tick.
pub fn compute(
    inputs: &AnalysisInputs,
    limits: &LimitsConfig,
    tier: Option<&str>,
    global_buffer_percent: f64,
    previous: &PreviousTargets,
    now: DateTime<Utc>,
) -> ComputeOutcome {
    let tier_override = tier.and_then(|t| limits.tenant_tiers.get(t));
    let buffer_percent = tier_override
        .and_then(|t| t.buffer_percent)
        .unwrap_or(global_buffer_percent);

    let min_bounds: LimitBounds = tier_override.and_then(|t| t.min).unwrap_or(limits.min);
    let max_bounds: LimitBounds = tier_override.and_then(|t| t.max).unwrap_or(limits.max);
    let mut warnings = Vec::new();

    // §4.6 mapping table: each derived limit is `max(existing, recommended)`
    // (or a scaled recommendation) *before* buffer and clamp are applied.
    let raw_rate = inputs
        .received_samples
        .map(|a| merge_existing(previous.ingestion_rate, a.recommended_value));
    let raw_burst = inputs
        .received_samples
        .map(|a| merge_existing(previous.ingestion_burst, 2.0 * a.recommended_value));
    let raw_max_series = inputs
        .memory_series
        .map(|a| merge_existing(previous.max_series, a.recommended_value));
    let raw_max_samples_per_query = inputs
        .query_volume
        .map(|a| merge_existing(previous.max_samples_per_query, a.recommended_value * 1000.0));

    let raw_targets = PreviousTargets {
        ingestion_rate: raw_rate.or(previous.ingestion_rate),
        ingestion_burst: raw_burst.or(previous.ingestion_burst),
        max_series: raw_max_series.or(previous.max_series),
        max_samples_per_query: raw_max_samples_per_query.or(previous.max_samples_per_query),
    };

    let mut ingestion_rate = raw_rate
        .map(|v| apply_buffer(v, buffer_percent))
        .map(|v| clamp(v, min_bounds.ingestion_rate, max_bounds.ingestion_rate, "ingestion_rate", &mut warnings));

    let ingestion_burst_size = raw_burst.map(|v| {
        clamp(
            apply_buffer(v, buffer_percent),
            min_bounds.ingestion_burst_size,
            max_bounds.ingestion_burst_size,
            "ingestion_burst_size",
            &mut warnings,
        )
    });

    let (ingestion_rate, ingestion_burst_size) = match (ingestion_rate.take(), ingestion_burst_size) {
        (Some(rate), Some(burst)) if burst < rate => (Some(rate), Some(rate)),
        (rate, burst) => (rate, burst),
    };

    let max_global_series_per_user = raw_max_series.map(|v| {
        clamp(
            apply_buffer(v, buffer_percent),
            min_bounds.max_global_series_per_user,
            max_bounds.max_global_series_per_user,
            "max_global_series_per_user",
            &mut warnings,
        )
    });

    let max_samples_per_query = raw_max_samples_per_query.map(|v| {
        clamp(
            apply_buffer(v, buffer_percent),
            min_bounds.max_samples_per_query,
            max_bounds.max_samples_per_query,
            "max_samples_per_query",
            &mut warnings,
        )
    });

    let any_analyzer_input = raw_rate.is_some() || raw_max_series.is_some() || raw_max_samples_per_query.is_some();
    let (source, reason) = if tier_override.is_some() {
        (
            LimitSource::Tier,
            format!("tenant tier '{}' buffer/bounds override applied", tier.unwrap_or("")),
        )
    } else if any_analyzer_input {
        (
            LimitSource::Analyzer,
            format!("derived from analyzer output with {buffer_percent}% buffer"),
        )
    } else {
        (
            LimitSource::Default,
            "no analyzer input this tick; global defaults and clamps only".to_string(),
        )
    };

    ComputeOutcome {
        limits: TenantLimits {
            ingestion_rate,
            ingestion_burst_size,
            max_global_series_per_user,
            max_samples_per_query,
            max_query_lookback_secs: max_bounds.max_query_lookback_secs,
            source,
            reason,
            computed_at: now,
        },
        raw_targets,
        clamp_warnings: warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitBounds;

    fn analysis(value: f64) -> AnalysisResult {
        AnalysisResult {
            current_value: value,
            moving_average: Some(value),
            percentile: value,
            peak: Some(value),
            trend_slope: 0.0,
            spike_active: false,
            spike_multiplier: 1.0,
            recommended_value: value,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn burst_is_restored_to_at_least_rate_after_clamping() {
        let mut limits = LimitsConfig::default();
        limits.max.ingestion_burst_size = Some(100.0);
        limits.max.ingestion_rate = Some(1_000_000.0);

        let inputs = AnalysisInputs {
            received_samples: Some(analysis(1000.0)),
            memory_series: None,
            query_volume: None,
        };
        let result = compute(&inputs, &limits, None, 0.0, &PreviousTargets::default(), Utc::now());
        assert_eq!(result.limits.ingestion_burst_size, result.limits.ingestion_rate);
    }

    #[test]
    fn min_greater_than_max_uses_max_for_both_bounds_and_warns() {
        let mut limits = LimitsConfig::default();
        limits.min.max_global_series_per_user = Some(1000.0);
        limits.max.max_global_series_per_user = Some(500.0);

        let inputs = AnalysisInputs {
            received_samples: None,
            memory_series: Some(analysis(750.0)),
            query_volume: None,
        };
        let result = compute(&inputs, &limits, None, 0.0, &PreviousTargets::default(), Utc::now());
        assert_eq!(result.limits.max_global_series_per_user, Some(500.0));
        assert_eq!(result.clamp_warnings.len(), 1);
    }

    #[test]
    fn tier_bounds_override_global_bounds() {
        let mut limits = LimitsConfig::default();
        limits.max.max_samples_per_query = Some(1_000_000.0);
        let mut tier = crate::config::TierOverride::default();
        tier.max = Some(LimitBounds {
            max_samples_per_query: Some(50.0),
            ..Default::default()
        });
        limits.tenant_tiers.insert("bronze".to_string(), tier);

        let inputs = AnalysisInputs {
            received_samples: None,
            memory_series: None,
            query_volume: Some(analysis(10_000.0)),
        };
        let result = compute(&inputs, &limits, Some("bronze"), 0.0, &PreviousTargets::default(), Utc::now());
        assert_eq!(result.limits.max_samples_per_query, Some(50.0));
        assert_eq!(result.limits.source, LimitSource::Tier);
    }

    #[test]
    fn tier_buffer_replaces_global_buffer() {
        let mut limits = LimitsConfig::default();
        let mut tier = crate::config::TierOverride::default();
        tier.buffer_percent = Some(0.0);
        limits.tenant_tiers.insert("gold".to_string(), tier);

        let inputs = AnalysisInputs {
            received_samples: Some(analysis(1000.0)),
            memory_series: None,
            query_volume: None,
        };
        let result = compute(&inputs, &limits, Some("gold"), 50.0, &PreviousTargets::default(), Utc::now());
        assert_eq!(result.limits.ingestion_rate, Some(1000.0));
    }

    /// End-to-end scenario 1 (§8): steady tenant, 1000/s, 20% buffer, no
    /// min/max configured. First tick, so `existing` is empty.
    #[test]
    fn steady_tenant_scenario_matches_seeded_expectation() {
        let limits = LimitsConfig::default();
        let inputs = AnalysisInputs {
            received_samples: Some(analysis(1000.0)),
            memory_series: None,
            query_volume: None,
        };
        let result = compute(&inputs, &limits, None, 20.0, &PreviousTargets::default(), Utc::now());
        assert_eq!(result.limits.ingestion_rate, Some(1200.0));
        assert_eq!(result.limits.ingestion_burst_size, Some(2400.0));
        assert_eq!(result.limits.source, LimitSource::Analyzer);
    }

    /// `max(existing, recommended)`: a lower recommendation this tick does
    /// not pull the derived limit back down below what was already tracked.
    #[test]
    fn existing_raw_target_floors_a_lower_recommendation() {
        let limits = LimitsConfig::default();
        let previous = PreviousTargets {
            ingestion_rate: Some(5000.0),
            ingestion_burst: Some(10_000.0),
            max_series: None,
            max_samples_per_query: None,
        };
        let inputs = AnalysisInputs {
            received_samples: Some(analysis(1000.0)),
            memory_series: None,
            query_volume: None,
        };
        let result = compute(&inputs, &limits, None, 0.0, &previous, Utc::now());
        assert_eq!(result.limits.ingestion_rate, Some(5000.0));
        assert_eq!(result.raw_targets.ingestion_rate, Some(5000.0));
    }

    #[test]
    fn query_volume_scales_by_one_thousand() {
        let limits = LimitsConfig::default();
        let inputs = AnalysisInputs {
            received_samples: None,
            memory_series: None,
            query_volume: Some(analysis(2.0)),
        };
        let result = compute(&inputs, &limits, None, 0.0, &PreviousTargets::default(), Utc::now());
        assert_eq!(result.limits.max_samples_per_query, Some(2000.0));
    }

    #[test]
    fn no_analyzer_input_yields_default_source_and_empty_record() {
        let limits = LimitsConfig::default();
        let inputs = AnalysisInputs {
            received_samples: None,
            memory_series: None,
            query_volume: None,
        };
        let result = compute(&inputs, &limits, None, 0.0, &PreviousTargets::default(), Utc::now());
        assert_eq!(result.limits.source, LimitSource::Default);
        assert_eq!(result.limits.ingestion_rate, None);
    }
}
