//! C7 — Overrides Publisher: renders the desired overrides document from the
//! current tick's computed limits, merges it with whatever tenants already
//! exist in the live artifact, and writes it back with CAS-protected retry.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::PublisherConfig;
use crate::k8s::K8sClient;
use crate::limits::TenantLimits;

const ARTIFACT_DATA_KEY: &str = "overrides.yaml";

/// The exact five keys §6 documents for the overrides artifact. No other
/// field (timestamps, internal bookkeeping) is ever written here — that's
/// what `TenantLimits` is for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedTenantLimits {
    pub ingestion_rate: Option<f64>,
    pub ingestion_burst_size: Option<f64>,
    pub max_global_series_per_user: Option<f64>,
    pub max_samples_per_query: Option<f64>,
    #[serde(rename = "max_query_lookback", with = "humantime_serde::option")]
    pub max_query_lookback: Option<Duration>,
}

impl From<TenantLimits> for PublishedTenantLimits {
    fn from(l: TenantLimits) -> Self {
        Self {
            ingestion_rate: l.ingestion_rate,
            ingestion_burst_size: l.ingestion_burst_size,
            max_global_series_per_user: l.max_global_series_per_user,
            max_samples_per_query: l.max_samples_per_query,
            max_query_lookback: l.max_query_lookback_secs.map(Duration::from_secs_f64),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OverridesDocument {
    pub overrides: HashMap<String, PublishedTenantLimits>,
}

/// Outcome of one publish attempt, for audit/observability.
pub enum PublishOutcome {
    NoOp,
    Published { tenants_changed: usize, suppressed: Vec<String> },
    DryRun { tenants_changed: usize, suppressed: Vec<String> },
}

fn parse_existing(cm: &ConfigMap) -> OverridesDocument {
    cm.data
        .as_ref()
        .and_then(|d| d.get(ARTIFACT_DATA_KEY))
        .and_then(|text| serde_yaml::from_str(text).ok())
        .unwrap_or_default()
}

/// Whether `fresh` raises any of the five published fields above what's
/// currently on record for this tenant. A tenant with no existing record has
/// nothing to protect, so it is never treated as an increase (§4.8 leaves
/// brand-new tenants unguarded by the breaker).
fn is_increase(existing: Option<&PublishedTenantLimits>, fresh: &TenantLimits) -> bool {
    let Some(existing) = existing else {
        return false;
    };
    fn bigger(existing: Option<f64>, fresh: Option<f64>) -> bool {
        matches!((existing, fresh), (Some(e), Some(f)) if f > e)
    }
    bigger(existing.ingestion_rate, fresh.ingestion_rate)
        || bigger(existing.ingestion_burst_size, fresh.ingestion_burst_size)
        || bigger(existing.max_global_series_per_user, fresh.max_global_series_per_user)
        || bigger(existing.max_samples_per_query, fresh.max_samples_per_query)
}

/// Apply the circuit breaker's increase gate (§4.8, §8 scenario 6): when
/// increases are disallowed, any tenant whose freshly computed record would
/// raise a field over what's currently published is held at its existing
/// values instead, while tenants whose record is a decrease (or unchanged)
/// still publish normally. Returns the gated map plus the tenants held back.
pub fn gate_increases(
    existing: &OverridesDocument,
    fresh: HashMap<String, TenantLimits>,
    allow_increase: bool,
    now: DateTime<Utc>,
) -> (HashMap<String, TenantLimits>, Vec<String>) {
    if allow_increase {
        return (fresh, Vec::new());
    }
    let mut suppressed = Vec::new();
    let gated = fresh
        .into_iter()
        .map(|(tenant, limits)| {
            let current = existing.overrides.get(&tenant);
            if is_increase(current, &limits) {
                suppressed.push(tenant.clone());
                let held = current
                    .map(|c| TenantLimits {
                        ingestion_rate: c.ingestion_rate,
                        ingestion_burst_size: c.ingestion_burst_size,
                        max_global_series_per_user: c.max_global_series_per_user,
                        max_samples_per_query: c.max_samples_per_query,
                        max_query_lookback_secs: c.max_query_lookback.map(|d| d.as_secs_f64()),
                        source: crate::limits::LimitSource::Default,
                        reason: "limit increase suppressed by open circuit breaker; holding at previously published value".to_string(),
                        computed_at: now,
                    })
                    .unwrap_or(limits);
                (tenant, held)
            } else {
                (tenant, limits)
            }
        })
        .collect();
    (gated, suppressed)
}

/// Merge freshly computed tenants into the existing document, preserving any
/// tenant not touched this tick as long as it's still within `known_tenants`
/// — the historical store's own tenant set, already eviction-horizon-pruned
/// by C3 (`HistoricalStore::prune`) before this is called. A tenant the
/// store has aged out entirely is the only thing `render_desired` drops.
pub fn render_desired(
    existing: &OverridesDocument,
    fresh: &HashMap<String, TenantLimits>,
    known_tenants: &HashSet<String>,
) -> OverridesDocument {
    let mut merged = existing.clone();
    for (tenant, limits) in fresh {
        merged
            .overrides
            .insert(tenant.clone(), PublishedTenantLimits::from(limits.clone()));
    }
    merged
        .overrides
        .retain(|tenant, _| fresh.contains_key(tenant) || known_tenants.contains(tenant));
    merged
}

pub struct Publisher<'a> {
    client: &'a K8sClient,
    config: &'a PublisherConfig,
    namespace: String,
    name: String,
    dry_run: bool,
    allow_increase: bool,
}

impl<'a> Publisher<'a> {
    pub fn new(
        client: &'a K8sClient,
        config: &'a PublisherConfig,
        namespace: impl Into<String>,
        name: impl Into<String>,
        dry_run: bool,
        allow_increase: bool,
    ) -> Self {
        Self {
            client,
            config,
            namespace: namespace.into(),
            name: name.into(),
            dry_run,
            allow_increase,
        }
    }

    /// Publish freshly computed tenant limits. Reads the current artifact,
    /// gates limit-increasing tenants behind the circuit breaker, merges,
    /// and — unless the five published fields are identical to what's
    /// already published for every tenant — writes it back under CAS with
    /// exponential retry on conflict.
    pub async fn publish(
        &self,
        fresh: HashMap<String, TenantLimits>,
        now: DateTime<Utc>,
        known_tenants: &HashSet<String>,
    ) -> Result<PublishOutcome> {
        let existing_cm = self
            .client
            .get_artifact(&self.namespace, &self.name)
            .await
            .context("reading current overrides artifact")?;

        let existing_doc = existing_cm
            .as_ref()
            .map(parse_existing)
            .unwrap_or_default();

        let (gated, suppressed) = gate_increases(&existing_doc, fresh, self.allow_increase, now);
        if !suppressed.is_empty() {
            warn!(
                "circuit breaker open: publish suppressed for {} tenant(s) with an increasing limit: {:?}",
                suppressed.len(),
                suppressed
            );
        }

        let desired_doc = render_desired(&existing_doc, &gated, known_tenants);

        // `PublishedTenantLimits` carries no timestamp, so this compares
        // only the five documented fields per tenant — unchanged values
        // produce a genuine no-op even across ticks with a different `now`.
        if desired_doc == existing_doc {
            return Ok(PublishOutcome::NoOp);
        }

        let tenants_changed = gated.len();

        if self.dry_run {
            info!(
                "dry-run: would publish overrides artifact '{}/{}' with {tenants_changed} tenant(s) changed",
                self.namespace, self.name
            );
            return Ok(PublishOutcome::DryRun { tenants_changed, suppressed });
        }

        let rendered = serde_yaml::to_string(&desired_doc).context("rendering overrides document")?;
        self.write_with_retry(existing_cm, rendered).await?;

        Ok(PublishOutcome::Published { tenants_changed, suppressed })
    }

    /// Best-effort rollout trigger (§4.7 step 5): touch a restart annotation
    /// on every configured workload. Never run in dry-run; one missing
    /// component does not fail the others.
    pub async fn trigger_rollout(&self, rollout: &crate::config::RolloutConfig, now: DateTime<Utc>) {
        if self.dry_run || !rollout.trigger_rollout {
            return;
        }
        let value = now.to_rfc3339();
        for component in &rollout.components {
            let result = tokio::time::timeout(
                rollout.trigger_deadline,
                self.client
                    .annotate_rollout(&self.namespace, component, &rollout.annotation_key, &value),
            )
            .await;
            match result {
                Ok(Ok(())) => info!("rollout triggered for component '{component}'"),
                Ok(Err(e)) => warn!("rollout trigger failed for component '{component}': {e:#}"),
                Err(_) => warn!("rollout trigger timed out for component '{component}'"),
            }
        }
    }

    async fn write_with_retry(&self, existing_cm: Option<ConfigMap>, rendered: String) -> Result<()> {
        let mut backoff_policy = ExponentialBackoff {
            initial_interval: self.config.retry_base_delay,
            max_elapsed_time: Some(self.config.cas_deadline),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut data = HashMap::new();
            data.insert(ARTIFACT_DATA_KEY.to_string(), rendered.clone());

            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };

            let expected_rv = existing_cm
                .as_ref()
                .and_then(|cm| cm.metadata.resource_version.as_deref());

            match self.client.put_artifact(&self.namespace, cm, expected_rv).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt as u32 >= self.config.max_retries => {
                    return Err(e).context("publishing overrides artifact: retries exhausted");
                }
                Err(e) => {
                    warn!("publish attempt {attempt} failed, retrying: {e:#}");
                    match backoff_policy.next_backoff() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => return Err(e).context("publishing overrides artifact: backoff exhausted"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(value: f64, at: DateTime<Utc>) -> TenantLimits {
        TenantLimits {
            ingestion_rate: Some(value),
            ingestion_burst_size: Some(value * 1.5),
            max_global_series_per_user: None,
            max_samples_per_query: None,
            max_query_lookback_secs: None,
            source: crate::limits::LimitSource::Analyzer,
            reason: "test fixture".to_string(),
            computed_at: at,
        }
    }

    #[test]
    fn render_desired_preserves_untouched_tenant_still_known_to_the_store() {
        let now = Utc::now();
        let mut existing = OverridesDocument::default();
        existing
            .overrides
            .insert("old-tenant".to_string(), PublishedTenantLimits::from(limits(10.0, now)));

        let mut fresh = HashMap::new();
        fresh.insert("new-tenant".to_string(), limits(20.0, now));
        let known_tenants: HashSet<String> = ["old-tenant".to_string(), "new-tenant".to_string()].into();

        let desired = render_desired(&existing, &fresh, &known_tenants);
        assert!(desired.overrides.contains_key("old-tenant"));
        assert!(desired.overrides.contains_key("new-tenant"));
    }

    #[test]
    fn render_desired_evicts_tenant_the_store_has_aged_out() {
        let now = Utc::now();
        let mut existing = OverridesDocument::default();
        existing
            .overrides
            .insert("stale-tenant".to_string(), PublishedTenantLimits::from(limits(10.0, now)));

        let fresh = HashMap::new();
        let known_tenants: HashSet<String> = HashSet::new();
        let desired = render_desired(&existing, &fresh, &known_tenants);
        assert!(!desired.overrides.contains_key("stale-tenant"));
    }

    #[test]
    fn render_desired_overwrites_same_tenant_with_fresh_value() {
        let now = Utc::now();
        let mut existing = OverridesDocument::default();
        existing
            .overrides
            .insert("t1".to_string(), PublishedTenantLimits::from(limits(10.0, now)));

        let mut fresh = HashMap::new();
        fresh.insert("t1".to_string(), limits(99.0, now));

        let known_tenants: HashSet<String> = ["t1".to_string()].into();
        let desired = render_desired(&existing, &fresh, &known_tenants);
        assert_eq!(desired.overrides.get("t1").unwrap().ingestion_rate, Some(99.0));
    }

    /// Regression: §8's "publishing the same limits twice is a no-op" relies
    /// on the comparison ignoring volatile per-tick timestamps. Two calls to
    /// `limits()` with different `at` values but the same numbers must
    /// produce byte-identical `PublishedTenantLimits`.
    #[test]
    fn published_tenant_limits_ignore_computed_at_for_equality() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::minutes(1);
        let a = PublishedTenantLimits::from(limits(42.0, t1));
        let b = PublishedTenantLimits::from(limits(42.0, t2));
        assert_eq!(a, b);
    }

    /// End-to-end scenario 6 (§8): breaker open, one tenant's new record
    /// increases, another's decreases. The increase is held at its existing
    /// value; the decrease still publishes.
    #[test]
    fn gate_increases_holds_back_only_increasing_tenants() {
        let now = Utc::now();
        let mut existing = OverridesDocument::default();
        existing
            .overrides
            .insert("grower".to_string(), PublishedTenantLimits::from(limits(1000.0, now)));
        existing
            .overrides
            .insert("shrinker".to_string(), PublishedTenantLimits::from(limits(1000.0, now)));

        let mut fresh = HashMap::new();
        fresh.insert("grower".to_string(), limits(2000.0, now));
        fresh.insert("shrinker".to_string(), limits(100.0, now));

        let (gated, suppressed) = gate_increases(&existing, fresh, false, now);
        assert_eq!(suppressed, vec!["grower".to_string()]);
        assert_eq!(gated.get("grower").unwrap().ingestion_rate, Some(1000.0));
        assert_eq!(gated.get("shrinker").unwrap().ingestion_rate, Some(100.0));
    }

    #[test]
    fn gate_increases_is_a_no_op_when_breaker_allows_increases() {
        let now = Utc::now();
        let existing = OverridesDocument::default();
        let mut fresh = HashMap::new();
        fresh.insert("t1".to_string(), limits(2000.0, now));

        let (gated, suppressed) = gate_increases(&existing, fresh, true, now);
        assert!(suppressed.is_empty());
        assert_eq!(gated.get("t1").unwrap().ingestion_rate, Some(2000.0));
    }

    #[test]
    fn gate_increases_never_suppresses_a_brand_new_tenant() {
        let now = Utc::now();
        let existing = OverridesDocument::default();
        let mut fresh = HashMap::new();
        fresh.insert("new-tenant".to_string(), limits(2000.0, now));

        let (gated, suppressed) = gate_increases(&existing, fresh, false, now);
        assert!(suppressed.is_empty());
        assert_eq!(gated.get("new-tenant").unwrap().ingestion_rate, Some(2000.0));
    }
}
