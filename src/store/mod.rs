//! C3 — Historical Store: an in-memory ring of recent samples per
//! (tenant, metric), windowed and pruned each tick. Single-writer
//! (the reconciler appends and prunes from one task), many-reader (the
//! analyzer and spike detector only ever read a window back).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::collector::{CollectedSamples, Sample, TenantId, TrackedMetric};

#[derive(Debug, Default)]
pub struct HistoricalStore {
    series: HashMap<(TenantId, TrackedMetric), Vec<Sample>>,
}

impl HistoricalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly collected samples. Idempotent on exact (timestamp, value)
    /// duplicates, so re-scraping an endpoint that hasn't advanced its
    /// counter between ticks doesn't inflate the series.
    pub fn append(&mut self, collected: CollectedSamples) {
        for (tenant, by_metric) in collected {
            for (metric, samples) in by_metric {
                let key = (tenant.clone(), metric);
                let series = self.series.entry(key).or_default();
                for sample in samples {
                    let duplicate = series
                        .iter()
                        .any(|s| s.timestamp == sample.timestamp && s.value == sample.value);
                    if !duplicate {
                        series.push(sample);
                    }
                }
                series.sort_by_key(|s| s.timestamp);
            }
        }
    }

    /// Samples at or after `now - window`, in non-decreasing timestamp order.
    pub fn window(&self, tenant: &str, metric: TrackedMetric, now: DateTime<Utc>, window: Duration) -> Vec<Sample> {
        let Ok(window) = chrono::Duration::from_std(window) else {
            return Vec::new();
        };
        let cutoff = now - window;
        self.series
            .get(&(tenant.to_string(), metric))
            .map(|series| {
                series
                    .iter()
                    .filter(|s| s.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct tenants with at least one retained sample for any metric.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut out: Vec<TenantId> = self
            .series
            .keys()
            .map(|(tenant, _)| tenant.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Evict samples older than `now - horizon` (the eviction horizon, twice
    /// the analysis window by policy). Empty series are dropped entirely so
    /// `tenants()` doesn't keep reporting tenants with nothing left.
    pub fn prune(&mut self, now: DateTime<Utc>, horizon: Duration) {
        let Ok(horizon) = chrono::Duration::from_std(horizon) else {
            return;
        };
        let cutoff = now - horizon;
        self.series.retain(|_, samples| {
            samples.retain(|s| s.timestamp >= cutoff);
            !samples.is_empty()
        });
    }
}
