//! Controller self-observability: a `/metrics` Prometheus endpoint and a
//! `/healthz` liveness probe, served on `observability.listen_addr`.
//!
//! Metric naming follows the platform's own `cortex_*` convention loosely,
//! prefixed `quotawarden_` to keep the controller's own series distinguishable
//! from the tenants it observes.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    static ref RECONCILE_TOTAL: CounterVec = register_counter_vec!(
        "quotawarden_reconcile_total",
        "Total reconcile ticks, partitioned by outcome.",
        &["outcome"]
    )
    .unwrap();
    static ref RECONCILE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "quotawarden_reconcile_duration_seconds",
        "Wall-clock time spent in a single reconcile tick.",
        &["outcome"]
    )
    .unwrap();
    static ref LAST_RECONCILE_TIMESTAMP: Gauge = register_gauge!(
        "quotawarden_last_reconcile_timestamp_seconds",
        "Unix timestamp of the end of the most recent reconcile tick."
    )
    .unwrap();
    static ref TENANTS_MONITORED: Gauge = register_gauge!(
        "quotawarden_tenants_monitored",
        "Number of tenants with at least one sample in the current window."
    )
    .unwrap();
    static ref TENANTS_SKIPPED: CounterVec = register_counter_vec!(
        "quotawarden_tenants_skipped_total",
        "Tenants skipped during analysis, partitioned by reason.",
        &["reason"]
    )
    .unwrap();
    static ref COLLECTION_TOTAL: CounterVec = register_counter_vec!(
        "quotawarden_collection_total",
        "Scrape attempts per source endpoint, partitioned by outcome.",
        &["source", "outcome"]
    )
    .unwrap();
    static ref COLLECTION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "quotawarden_collection_duration_seconds",
        "Scrape latency per source endpoint.",
        &["source"]
    )
    .unwrap();
    static ref SPIKES_DETECTED_TOTAL: CounterVec = register_counter_vec!(
        "quotawarden_spikes_detected_total",
        "Spike onsets detected, partitioned by tenant and metric.",
        &["tenant", "metric"]
    )
    .unwrap();
    static ref SPIKE_CURRENT_MULTIPLIER: GaugeVec = register_gauge_vec!(
        "quotawarden_spike_current_multiplier",
        "Currently applied spike headroom multiplier, per tenant and metric.",
        &["tenant", "metric"]
    )
    .unwrap();
    static ref ARTIFACT_UPDATE_TOTAL: CounterVec = register_counter_vec!(
        "quotawarden_artifact_update_total",
        "Overrides artifact publish attempts, partitioned by outcome.",
        &["outcome"]
    )
    .unwrap();
    static ref ARTIFACT_UPDATE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "quotawarden_artifact_update_duration_seconds",
        "Latency of the CAS round-trip publishing the overrides artifact.",
        &["outcome"]
    )
    .unwrap();
    static ref LAST_ARTIFACT_UPDATE_TIMESTAMP: Gauge = register_gauge!(
        "quotawarden_last_artifact_update_timestamp_seconds",
        "Unix timestamp of the last successful artifact publish."
    )
    .unwrap();
    static ref CIRCUIT_BREAKER_STATE: Gauge = register_gauge!(
        "quotawarden_circuit_breaker_state",
        "Circuit breaker state: 0=closed, 1=half-open, 2=open."
    )
    .unwrap();
    static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "quotawarden_errors_total",
        "Reconcile errors, partitioned by originating component.",
        &["component"]
    )
    .unwrap();
    static ref DISCOVERY_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "quotawarden_discovery_errors_total",
        "Endpoint discovery strategy failures, partitioned by strategy.",
        &["strategy"]
    )
    .unwrap();
}

/// Handle used by the collector and other components to report
/// per-operation observations without reaching into the `lazy_static`
/// registry directly.
#[derive(Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn observe_collection(&self, source: &str, elapsed: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        COLLECTION_TOTAL.with_label_values(&[source, outcome]).inc();
        COLLECTION_DURATION_SECONDS
            .with_label_values(&[source])
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_reconcile(&self, elapsed: Duration, outcome: &str) {
        RECONCILE_TOTAL.with_label_values(&[outcome]).inc();
        RECONCILE_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
        LAST_RECONCILE_TIMESTAMP.set(now_unix_seconds());
    }

    pub fn set_tenants_monitored(&self, count: usize) {
        TENANTS_MONITORED.set(count as f64);
    }

    pub fn inc_tenants_skipped(&self, reason: &str) {
        TENANTS_SKIPPED.with_label_values(&[reason]).inc();
    }

    pub fn record_spike(&self, tenant: &str, metric: &str, multiplier: f64) {
        SPIKES_DETECTED_TOTAL.with_label_values(&[tenant, metric]).inc();
        SPIKE_CURRENT_MULTIPLIER
            .with_label_values(&[tenant, metric])
            .set(multiplier);
    }

    pub fn set_spike_multiplier(&self, tenant: &str, metric: &str, multiplier: f64) {
        SPIKE_CURRENT_MULTIPLIER
            .with_label_values(&[tenant, metric])
            .set(multiplier);
    }

    pub fn observe_artifact_update(&self, elapsed: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        ARTIFACT_UPDATE_TOTAL.with_label_values(&[outcome]).inc();
        ARTIFACT_UPDATE_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
        if success {
            LAST_ARTIFACT_UPDATE_TIMESTAMP.set(now_unix_seconds());
        }
    }

    pub fn set_circuit_breaker_state(&self, state: u8) {
        CIRCUIT_BREAKER_STATE.set(state as f64);
    }

    pub fn inc_error(&self, component: &str) {
        ERRORS_TOTAL.with_label_values(&[component]).inc();
    }

    pub fn inc_discovery_error(&self, strategy: &str) {
        DISCOVERY_ERRORS_TOTAL.with_label_values(&[strategy]).inc();
    }
}

fn now_unix_seconds() -> f64 {
    chrono::Utc::now().timestamp() as f64
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::error!("failed to encode metrics: {e}");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    let body = String::from_utf8(buffer).unwrap_or_default();
    (axum::http::StatusCode::OK, body)
}

async fn healthz_handler(State(_metrics): State<Metrics>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

/// Bind and serve `/metrics` and `/healthz` until the process exits. Intended
/// to be spawned as its own task alongside the reconcile loop.
pub async fn serve(listen_addr: &str, metrics: Metrics) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("parsing observability listen address '{listen_addr}'"))?;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(metrics);

    log::info!("observability server listening on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .context("observability server terminated")
}
