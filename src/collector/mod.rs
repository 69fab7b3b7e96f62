//! C2 — Metrics Collector: scrape discovered endpoints, parse text exposition,
//! and group samples by tenant. Also hosts the synthetic drop-in generator
//! used for tests and demo deployments (see design notes §9, "Polymorphism
//! over collectors").

mod parse;
mod synthetic;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::DiscoveryConfig;
use crate::discovery::ScrapeTarget;
use crate::observability::Metrics;

pub use synthetic::SyntheticCollector;

pub type TenantId = String;

/// The closed allow-list of metric names the analyzer consumes (§4.4). Any
/// sample whose exposed name doesn't match one of these is ignored during
/// parsing; C2 never hands C4 a metric it isn't prepared to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackedMetric {
    DistributorReceivedSamples,
    IngesterMemorySeries,
    QuerierQueryCount,
    QueryFrontendQueryCount,
}

impl TrackedMetric {
    pub const ALL: [TrackedMetric; 4] = [
        TrackedMetric::DistributorReceivedSamples,
        TrackedMetric::IngesterMemorySeries,
        TrackedMetric::QuerierQueryCount,
        TrackedMetric::QueryFrontendQueryCount,
    ];

    /// The exact exposition-format metric name this variant matches.
    pub fn exposed_name(&self) -> &'static str {
        match self {
            TrackedMetric::DistributorReceivedSamples => "cortex_distributor_received_samples_total",
            TrackedMetric::IngesterMemorySeries => "cortex_ingester_memory_series",
            TrackedMetric::QuerierQueryCount => "cortex_querier_queries_total",
            TrackedMetric::QueryFrontendQueryCount => "cortex_query_frontend_queries_total",
        }
    }

    pub fn from_exposed_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.exposed_name() == name)
    }
}

/// One normalized observation: a scalar value for one tenant on one tracked
/// metric, at one point in time, from one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub tenant: TenantId,
    pub metric: TrackedMetric,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub labels: HashMap<String, String>,
}

/// Samples grouped the way C3 wants to ingest them: tenant -> metric -> samples.
pub type CollectedSamples = HashMap<TenantId, HashMap<TrackedMetric, Vec<Sample>>>;

fn insert_sample(out: &mut CollectedSamples, sample: Sample) {
    out.entry(sample.tenant.clone())
        .or_default()
        .entry(sample.metric)
        .or_default()
        .push(sample);
}

/// The tenant label name/value is the first hit, in this priority order (§3).
const TENANT_LABEL_NAMES: [&str; 3] = ["user", "tenant", "tenant_id"];

pub(crate) fn extract_tenant(labels: &HashMap<String, String>) -> Option<TenantId> {
    TENANT_LABEL_NAMES.iter().find_map(|name| {
        labels
            .get(*name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    })
}

/// Real, network-scraping collector. One instance per process when not in
/// synthetic mode; never coexists with `SyntheticCollector`.
pub struct RealCollector {
    http: reqwest::Client,
    auth_header: Option<(String, String)>,
    concurrency: usize,
    metrics: Metrics,
}

impl RealCollector {
    pub fn new(config: &DiscoveryConfig, metrics: Metrics) -> Self {
        let auth_header = match (&config.auth_header_name, &config.auth_header_value) {
            (Some(name), Some(value)) => Some((name.clone(), value.clone())),
            _ => None,
        };
        Self {
            http: reqwest::Client::new(),
            auth_header,
            concurrency: config.scrape_concurrency.max(1),
            metrics,
        }
    }

    /// Scrape every target with bounded parallelism, isolating per-endpoint
    /// failures (§4.2: one bad endpoint does not abort the tick).
    pub async fn collect(
        &self,
        targets: &[ScrapeTarget],
        deadline: Duration,
    ) -> CollectedSamples {
        let results: Vec<(String, Result<Vec<Sample>>)> = stream::iter(targets.iter().cloned())
            .map(|target| {
                let this = self;
                async move {
                    let started = std::time::Instant::now();
                    let result = this.scrape_one(&target, deadline).await;
                    this.metrics
                        .observe_collection(&target.url, started.elapsed(), result.is_ok());
                    (target.url.clone(), result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut out = CollectedSamples::new();
        for (url, result) in results {
            match result {
                Ok(samples) => {
                    for sample in samples {
                        insert_sample(&mut out, sample);
                    }
                }
                Err(e) => {
                    warn!("scrape failed for {url}: {e:#}");
                }
            }
        }
        out
    }

    async fn scrape_one(&self, target: &ScrapeTarget, deadline: Duration) -> Result<Vec<Sample>> {
        let mut req = self.http.get(&target.url).timeout(deadline);
        if let Some((name, value)) = &self.auth_header {
            req = req.header(name, value);
        }
        let body = req.send().await?.error_for_status()?.text().await?;
        let samples = parse::parse_exposition(&body, &target.url);
        debug!("scraped {} samples from {}", samples.len(), target.url);
        Ok(samples)
    }
}

/// Either variant the reconciler drives identically; chosen once at process
/// start from `Config::synthetic`.
pub enum Collector {
    Real(RealCollector),
    Synthetic(SyntheticCollector),
}

impl Collector {
    pub async fn collect(
        &self,
        targets: &[ScrapeTarget],
        deadline: Duration,
    ) -> CollectedSamples {
        match self {
            Collector::Real(c) => c.collect(targets, deadline).await,
            Collector::Synthetic(c) => c.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_label_priority_prefers_user_over_tenant() {
        let mut labels = HashMap::new();
        labels.insert("tenant".to_string(), "b".to_string());
        labels.insert("user".to_string(), "a".to_string());
        assert_eq!(extract_tenant(&labels), Some("a".to_string()));
    }

    #[test]
    fn missing_tenant_label_yields_none() {
        let mut labels = HashMap::new();
        labels.insert("pod".to_string(), "x".to_string());
        assert_eq!(extract_tenant(&labels), None);
    }

    #[test]
    fn empty_tenant_label_value_is_dropped() {
        let mut labels = HashMap::new();
        labels.insert("tenant_id".to_string(), "   ".to_string());
        assert_eq!(extract_tenant(&labels), None);
    }

    #[test]
    fn tracked_metric_round_trips_exposed_name() {
        for m in TrackedMetric::ALL {
            assert_eq!(TrackedMetric::from_exposed_name(m.exposed_name()), Some(m));
        }
        assert_eq!(TrackedMetric::from_exposed_name("unrelated_metric"), None);
    }
}
