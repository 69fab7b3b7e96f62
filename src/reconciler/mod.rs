//! C9 — Reconciler: the single ticker-driven loop that runs discovery,
//! collection, storage, analysis, spike detection, limit calculation, the
//! circuit breaker and publish in strict sequence every tick.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::Utc;
use log::{error, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::analysis;
use crate::audit::{AuditEvent, SharedAuditSink};
use crate::breaker::CircuitBreaker;
use crate::collector::{Collector, TrackedMetric};
use crate::config::Config;
use crate::discovery::{self, ScrapeTarget};
use crate::k8s::K8sClient;
use crate::limits::{self, AnalysisInputs};
use crate::observability::Metrics;
use crate::publisher::{Publisher, PublishOutcome};
use crate::spike::SpikeDetector;
use crate::store::HistoricalStore;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("endpoint discovery failed: {0}")]
    Discovery(String),
    #[error("collection failed: {0}")]
    Collection(String),
    #[error("analysis failed: {0}")]
    Analysis(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("tick deadline exceeded")]
    Deadline,
}

/// The fields C9 threads through every tick; held behind a process-wide
/// mutex so `run()` and `tick_once()` can never execute concurrently.
pub struct Reconciler {
    config: Config,
    k8s: K8sClient,
    collector: Collector,
    metrics: Metrics,
    audit: SharedAuditSink,
    state: Mutex<ReconcilerState>,
}

/// Output of the deadline-bounded prepare phase, carried into the unbounded
/// publish phase. Kept separate from `ReconcilerState` since it's per-tick
/// data, not state that survives across ticks.
struct ReadyToPublish {
    computed: HashMap<String, limits::TenantLimits>,
    /// Every tenant the historical store still has samples for, already
    /// pruned to `eviction_horizon`. A tenant outside `computed` (no
    /// analyzer window this tick) but still in this set stays published at
    /// its prior values; only a tenant the store has aged out entirely is
    /// dropped from the artifact.
    known_tenants: HashSet<String>,
    now: chrono::DateTime<Utc>,
    dry_run: bool,
    breaker_allows_increase: bool,
}

#[derive(Default)]
struct ReconcilerState {
    store: HistoricalStore,
    spikes: SpikeDetector,
    breaker: CircuitBreaker,
    /// Pre-buffer derived targets per tenant, carried across ticks so §4.6's
    /// `max(existing, recommended)` mapping rule has an `existing` to read.
    previous_targets: HashMap<String, limits::PreviousTargets>,
    /// Most recent non-empty discovery result, used as a fallback when a
    /// tick's own discovery comes back empty (§7: "last known sources reused
    /// if any; else tick skipped").
    last_known_targets: Vec<ScrapeTarget>,
}

impl Reconciler {
    pub fn new(config: Config, k8s: K8sClient, collector: Collector, metrics: Metrics, audit: SharedAuditSink) -> Self {
        Self {
            config,
            k8s,
            collector,
            metrics,
            audit,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    /// Run forever on `controller.update_interval`, logging (but not
    /// propagating) per-tick errors so one bad tick doesn't kill the process.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.controller.update_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick_once().await {
                error!("reconcile tick failed: {e:#}");
                self.metrics.inc_error(component_of(&e));
            }
        }
    }

    /// Run exactly one tick; used by the `Once` CLI subcommand and by tests.
    ///
    /// The tick deadline (§5 "Cancellation") bounds discover/collect/analyze/
    /// breaker only. The publish step is deliberately run outside that
    /// timeout: its own `cas_deadline`-bounded backoff is the only deadline
    /// allowed to interrupt it, so a tick that runs long never truncates a
    /// CAS round-trip mid-flight and risks a torn write.
    pub async fn tick_once(&self) -> Result<(), ReconcileError> {
        let started = Instant::now();
        let deadline = self
            .config
            .controller
            .update_interval
            .checked_sub(self.config.controller.tick_deadline_margin)
            .unwrap_or(self.config.controller.update_interval);

        let prepared = tokio::time::timeout(deadline, self.run_sequence()).await;
        let result = match prepared {
            Ok(Ok(ready)) => self.run_publish(ready).await,
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("reconcile tick exceeded its deadline of {deadline:?}; in-flight work abandoned, no partial publish");
                Err(ReconcileError::Deadline)
            }
        };

        let outcome = match &result {
            Ok(()) => "success",
            Err(ReconcileError::Deadline) => "deadline_exceeded",
            Err(_) => "error",
        };
        self.metrics.observe_reconcile(started.elapsed(), outcome);
        result
    }

    /// Discover, collect, store, analyze, detect spikes, compute limits, and
    /// consult the breaker — everything up to (but not including) publish.
    /// Bounded by the tick deadline in `tick_once`.
    async fn run_sequence(&self) -> Result<ReadyToPublish, ReconcileError> {
        let now = Utc::now();
        let dry_run = self.config.controller.mode.is_dry_run();
        let targets = match discovery::discover(&self.k8s, &self.config.discovery, &self.metrics).await {
            Ok(targets) => {
                let mut state = self.state.lock().await;
                state.last_known_targets = targets.clone();
                targets
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                if state.last_known_targets.is_empty() {
                    return Err(ReconcileError::Discovery(format!("{e:#}")));
                }
                warn!("discovery failed this tick ({e:#}); falling back to last known {} target(s)", state.last_known_targets.len());
                let _ = self.audit.emit(
                    &AuditEvent::new("discovery_fallback", format!("discovery failed: {e:#}; reused last known targets"))
                        .dry_run(dry_run),
                );
                state.last_known_targets.clone()
            }
        };

        let scrape_deadline = self.config.discovery.scrape_deadline;
        let collected = self.collector.collect(&targets, scrape_deadline).await;

        let mut state = self.state.lock().await;
        state.store.append(collected);
        state.store.prune(now, self.config.eviction_horizon());

        let tenants = state.store.tenants();
        self.metrics.set_tenants_monitored(tenants.len());

        let mut computed: HashMap<String, limits::TenantLimits> = HashMap::new();
        let mut max_blast = 0.0_f64;

        for tenant in &tenants {
            let (received_samples, received_ended) =
                analyze_metric(&mut state, tenant, TrackedMetric::DistributorReceivedSamples, &self.config, now);
            let (memory_series, _) =
                analyze_metric(&mut state, tenant, TrackedMetric::IngesterMemorySeries, &self.config, now);
            let (querier_volume, querier_ended) =
                analyze_metric(&mut state, tenant, TrackedMetric::QuerierQueryCount, &self.config, now);
            let (query_volume, query_volume_ended) = if querier_volume.is_some() {
                (querier_volume, querier_ended)
            } else {
                analyze_metric(&mut state, tenant, TrackedMetric::QueryFrontendQueryCount, &self.config, now)
            };

            for ended in [received_ended, query_volume_ended] {
                if ended {
                    let _ = self.audit.emit(
                        &AuditEvent::new("spike_ended", "current value settled back under threshold")
                            .tenant(tenant.clone())
                            .dry_run(dry_run),
                    );
                }
            }

            if received_samples.is_none() && memory_series.is_none() && query_volume.is_none() {
                self.metrics.inc_tenants_skipped("no_samples_in_window");
                continue;
            }

            let mut observed_ingestion_rate = None;
            if let Some(r) = &received_samples {
                observed_ingestion_rate = Some(r.current_value);
                if r.spike_active {
                    self.metrics.record_spike(tenant, "ingestion_rate", r.spike_multiplier);
                }
            }

            let inputs = AnalysisInputs {
                received_samples,
                memory_series,
                query_volume,
            };
            let tier = None; // tenant-to-tier mapping is an operator-provided extension point
            let previous = state.previous_targets.get(tenant).copied().unwrap_or_default();
            let outcome = limits::compute(
                &inputs,
                &self.config.limits,
                tier,
                self.config.controller.buffer_percentage,
                &previous,
                now,
            );
            state.previous_targets.insert(tenant.clone(), outcome.raw_targets);

            for warning in &outcome.clamp_warnings {
                let _ = self.audit.emit(
                    &AuditEvent::new("limit_clamp_misconfigured", warning.clone())
                        .tenant(tenant.clone())
                        .dry_run(dry_run),
                );
            }

            // Blast is measured against actual platform traffic (§4.8), not
            // against the controller's own carried-forward recommendation —
            // a quiet tenant sitting on a high `max(existing, recommended)`
            // floor must not permanently read as a blast.
            if let Some(rate) = observed_ingestion_rate {
                max_blast = max_blast.max(rate);
            }
            self.emit_limit_audit(tenant, &previous, &outcome.limits, dry_run);
            computed.insert(tenant.clone(), outcome.limits);
        }

        state
            .previous_targets
            .retain(|tenant, _| tenants.contains(tenant));

        // Circuit breaker observes this tick's blast before publish decides
        // whether increases are allowed.
        let error_rate = 0.0; // no recent scrape/publish failure tracking wired to a rate yet
        let just_opened = state
            .breaker
            .observe(error_rate, max_blast, &self.config.circuit_breaker, now);
        self.metrics
            .set_circuit_breaker_state(state.breaker.state().as_gauge_value());
        if !state.breaker.allow_increase() {
            state.spikes.clamp_all(state.breaker.spike_multiplier_ceiling());
        }
        let breaker_allows_increase = state.breaker.allow_increase();
        drop(state);

        if just_opened {
            warn!("circuit breaker tripped open this tick");
            let _ = self.audit.emit(
                &AuditEvent::new("circuit_breaker_panic", "error rate or blast ceiling exceeded")
                    .dry_run(dry_run),
            );
        }

        let known_tenants: HashSet<String> = tenants.into_iter().collect();

        Ok(ReadyToPublish {
            computed,
            known_tenants,
            now,
            dry_run,
            breaker_allows_increase,
        })
    }

    /// Publish step, run unbounded by the tick deadline (see `tick_once`):
    /// the CAS write and optional rollout trigger are governed only by their
    /// own configured deadlines.
    async fn run_publish(&self, ready: ReadyToPublish) -> Result<(), ReconcileError> {
        let ReadyToPublish {
            computed,
            known_tenants,
            now,
            dry_run,
            breaker_allows_increase,
        } = ready;

        let publish_started = Instant::now();
        let publisher = Publisher::new(
            &self.k8s,
            &self.config.publisher,
            &self.config.controller.artifact_namespace,
            &self.config.controller.artifact_name,
            dry_run,
            breaker_allows_increase,
        );
        let publish_result = publisher.publish(computed, now, &known_tenants).await;

        match publish_result {
            Ok(outcome) => {
                self.metrics.observe_artifact_update(publish_started.elapsed(), true);
                self.emit_publish_audit(&outcome, dry_run);
                if matches!(outcome, PublishOutcome::Published { .. }) {
                    publisher.trigger_rollout(&self.config.rollout, now).await;
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.observe_artifact_update(publish_started.elapsed(), false);
                let _ = self.audit.emit(
                    &AuditEvent::new("publish", "scheduled tick")
                        .dry_run(dry_run)
                        .failed(format!("{e:#}")),
                );
                Err(ReconcileError::Publish(format!("{e:#}")))
            }
        }
    }

    /// Emit one audit event per tenant decision, carrying the pre-buffer
    /// derived targets this tenant entered the tick with (`before`) and the
    /// published-shape record it leaves with (`after`).
    fn emit_limit_audit(&self, tenant: &str, before: &limits::PreviousTargets, after: &limits::TenantLimits, dry_run: bool) {
        let before_json = serde_json::json!({
            "ingestion_rate": before.ingestion_rate,
            "ingestion_burst": before.ingestion_burst,
            "max_series": before.max_series,
            "max_samples_per_query": before.max_samples_per_query,
        });
        let after_json = serde_json::json!({
            "ingestion_rate": after.ingestion_rate,
            "ingestion_burst_size": after.ingestion_burst_size,
            "max_global_series_per_user": after.max_global_series_per_user,
            "max_samples_per_query": after.max_samples_per_query,
            "source": after.source.as_str(),
        });
        let event = AuditEvent::new("limit_computed", after.reason.clone())
            .tenant(tenant.to_string())
            .before(before_json)
            .after(after_json)
            .dry_run(dry_run);
        let _ = self.audit.emit(&event);
    }

    fn emit_publish_audit(&self, outcome: &PublishOutcome, dry_run: bool) {
        let (action, reason) = match outcome {
            PublishOutcome::NoOp => ("publish_noop", "rendered document identical to current artifact"),
            PublishOutcome::Published { .. } => ("publish", "scheduled tick"),
            PublishOutcome::DryRun { .. } => ("publish_dry_run", "dry-run mode: CAS and rollout skipped"),
        };
        let _ = self.audit.emit(&AuditEvent::new(action, reason).dry_run(dry_run));
    }
}

/// Returns the analysis result (if the window has any samples) and whether
/// this call observed a spike-ended transition for this (tenant, metric).
fn analyze_metric(
    state: &mut ReconcilerState,
    tenant: &str,
    metric: TrackedMetric,
    config: &Config,
    now: chrono::DateTime<Utc>,
) -> (Option<analysis::AnalysisResult>, bool) {
    let window = state.store.window(tenant, metric, now, config.analysis.analysis_window);
    if window.is_empty() {
        return (None, false);
    }
    let decision = state.spikes.evaluate(tenant, metric, &window, &config.spike, now);
    let result = analysis::analyze(&window, &config.analysis, decision.active, decision.multiplier, now);
    (result, decision.just_ended)
}

fn component_of(e: &ReconcileError) -> &'static str {
    match e {
        ReconcileError::Discovery(_) => "discovery",
        ReconcileError::Collection(_) => "collection",
        ReconcileError::Analysis(_) => "analysis",
        ReconcileError::Publish(_) => "publish",
        ReconcileError::Deadline => "deadline",
    }
}
