//! C1 — Endpoint Discovery: resolve the set of metrics endpoints to scrape
//! this tick. Three strategies feed a single union, keyed by URL so the same
//! endpoint found twice (e.g. an explicit URL that also matches a label
//! selector) is only scraped once.

use std::collections::HashMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use log::warn;

use crate::config::DiscoveryConfig;
use crate::k8s::K8sClient;
use crate::observability::Metrics;

/// One resolved scrape target: a fully-qualified URL plus the service it
/// came from, for log/audit correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    pub url: String,
    pub service_name: String,
}

fn default_path(configured: &str) -> &str {
    if configured.is_empty() {
        "/metrics"
    } else {
        configured
    }
}

fn resolve_port(svc: &Service, port_name: &str, fallback: Option<u16>) -> u16 {
    let ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .cloned()
        .unwrap_or_default();

    if let Some(p) = ports.iter().find(|p| p.name.as_deref() == Some(port_name)) {
        return p.port as u16;
    }
    if let Some(port) = fallback {
        return port;
    }
    8080
}

fn build_url(host: &str, port: u16, path: &str) -> String {
    format!("http://{host}:{port}{path}")
}

/// Discover scrape targets via every configured strategy and union them by
/// URL. Per §4.1, a single strategy failing (e.g. the k8s API rejecting a
/// label selector) is logged and counted but does not abort the others —
/// only an empty union across all strategies is fatal for the tick.
pub async fn discover(client: &K8sClient, config: &DiscoveryConfig, metrics: &Metrics) -> Result<Vec<ScrapeTarget>> {
    if !config.enabled {
        return Ok(Vec::new());
    }

    let mut targets: HashMap<String, ScrapeTarget> = HashMap::new();
    let path = default_path(&config.metrics_path);

    for url in &config.urls {
        targets.insert(
            url.clone(),
            ScrapeTarget {
                url: url.clone(),
                service_name: "explicit".to_string(),
            },
        );
    }

    if let Some(selector) = &config.label_selector {
        match discover_by_selector(client, config, selector, path).await {
            Ok(services) => {
                for target in services {
                    targets.insert(target.url.clone(), target);
                }
            }
            Err(e) => {
                warn!("discovery strategy 'label_selector' failed: {e:#}");
                metrics.inc_discovery_error("label_selector");
            }
        }
    }

    if !config.service_names.is_empty() {
        match discover_by_names(client, config, path).await {
            Ok(services) => {
                for target in services {
                    targets.insert(target.url.clone(), target);
                }
            }
            Err(e) => {
                warn!("discovery strategy 'service_names' failed: {e:#}");
                metrics.inc_discovery_error("service_names");
            }
        }
    }

    let mut result: Vec<ScrapeTarget> = targets.into_values().collect();
    result.sort_by(|a, b| a.url.cmp(&b.url));

    if result.is_empty() {
        anyhow::bail!("endpoint discovery produced an empty target set");
    }
    Ok(result)
}

async fn discover_by_selector(
    client: &K8sClient,
    config: &DiscoveryConfig,
    selector: &str,
    path: &str,
) -> Result<Vec<ScrapeTarget>> {
    let api: Api<Service> = match &config.namespace {
        Some(ns) => Api::namespaced(client.kube().clone(), ns),
        None => Api::all(client.kube().clone()),
    };
    let lp = ListParams::default().labels(selector);
    let list = api
        .list(&lp)
        .await
        .context("listing services for discovery label selector")?;

    let mut out = Vec::new();
    for svc in list.items {
        let Some(name) = svc.metadata.name.clone() else {
            continue;
        };
        let namespace = svc.metadata.namespace.clone().unwrap_or_default();
        let port = resolve_port(&svc, &config.port_name, config.port);
        let host = format!("{name}.{namespace}.svc.cluster.local");
        out.push(ScrapeTarget {
            url: build_url(&host, port, path),
            service_name: name,
        });
    }
    Ok(out)
}

async fn discover_by_names(
    client: &K8sClient,
    config: &DiscoveryConfig,
    path: &str,
) -> Result<Vec<ScrapeTarget>> {
    let namespace = config.namespace.clone().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(client.kube().clone(), &namespace);

    let mut out = Vec::new();
    for name in &config.service_names {
        match api.get(name).await {
            Ok(svc) => {
                let port = resolve_port(&svc, &config.port_name, config.port);
                let host = format!("{name}.{namespace}.svc.cluster.local");
                out.push(ScrapeTarget {
                    url: build_url(&host, port, path),
                    service_name: name.clone(),
                });
            }
            Err(e) => {
                warn!("discovery: service '{name}' in namespace '{namespace}' not found: {e}");
            }
        }
    }
    Ok(out)
}
