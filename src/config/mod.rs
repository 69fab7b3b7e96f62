//! Controller configuration: the typed shape of the recognized options table.
//!
//! Loading itself (file path resolution, CLI flag precedence) lives in
//! `cli::load_config`; this module owns the schema and the validation of the
//! dynamic limit-value union described in the design notes.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerMode {
    DryRun,
    Prod,
}

impl Default for ControllerMode {
    fn default() -> Self {
        ControllerMode::DryRun
    }
}

impl ControllerMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, ControllerMode::DryRun)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub mode: ControllerMode,
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,
    pub buffer_percentage: f64,
    /// Safety margin subtracted from `update_interval` to derive the per-tick deadline.
    #[serde(with = "humantime_serde")]
    pub tick_deadline_margin: Duration,
    /// ConfigMap holding the published overrides document.
    pub artifact_name: String,
    pub artifact_namespace: String,
    pub cluster_name: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ControllerMode::default(),
            update_interval: Duration::from_secs(60),
            buffer_percentage: 20.0,
            tick_deadline_margin: Duration::from_secs(5),
            artifact_name: "tenant-overrides".to_string(),
            artifact_namespace: "monitoring".to_string(),
            cluster_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub service_names: Vec<String>,
    pub urls: Vec<String>,
    pub port_name: String,
    pub port: Option<u16>,
    pub metrics_path: String,
    pub auth_header_name: Option<String>,
    pub auth_header_value: Option<String>,
    #[serde(with = "humantime_serde")]
    pub scrape_deadline: Duration,
    pub scrape_concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: None,
            label_selector: None,
            service_names: Vec::new(),
            urls: Vec::new(),
            port_name: "metrics".to_string(),
            port: None,
            metrics_path: "/metrics".to_string(),
            auth_header_name: None,
            auth_header_value: None,
            scrape_deadline: Duration::from_secs(10),
            scrape_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    #[serde(with = "humantime_serde")]
    pub analysis_window: Duration,
    pub percentile: f64,
    pub use_moving_average: bool,
    pub include_peaks: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            analysis_window: Duration::from_secs(30 * 60),
            percentile: 95.0,
            use_moving_average: true,
            include_peaks: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpikeConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub max_spike_multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub detection_window: Duration,
    #[serde(with = "humantime_serde")]
    pub cooldown_period: Duration,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 3.0,
            max_spike_multiplier: 4.0,
            detection_window: Duration::from_secs(30 * 60),
            cooldown_period: Duration::from_secs(15 * 60),
        }
    }
}

/// One leaf of the dynamic limit-value union: either a plain number or a
/// duration string (only meaningful for `max_query_lookback`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LimitValue {
    Number(f64),
    Duration(String),
}

impl LimitValue {
    fn as_number(&self, field: &str) -> Result<f64> {
        match self {
            LimitValue::Number(n) => Ok(*n),
            LimitValue::Duration(s) => {
                bail!("limit field '{field}' expects a number, got duration string '{s}'")
            }
        }
    }

    fn as_duration_secs(&self, field: &str) -> Result<f64> {
        match self {
            LimitValue::Duration(s) => {
                let d = humantime::parse_duration(s)
                    .with_context(|| format!("parsing duration for '{field}': '{s}'"))?;
                Ok(d.as_secs_f64())
            }
            LimitValue::Number(n) => Ok(*n),
        }
    }
}

/// The closed set of limit-name keys the platform's overrides document
/// recognizes. Anything else in a `min`/`max`/tier map is a config error.
const KNOWN_LIMIT_FIELDS: &[&str] = &[
    "ingestion_rate",
    "ingestion_burst_size",
    "max_global_series_per_user",
    "max_samples_per_query",
    "max_query_lookback",
];

/// Typed, validated bounds for the five tunable fields. Produced from a raw
/// `HashMap<String, LimitValue>` at config load time so later stages never
/// see an unknown key or an ill-typed leaf.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitBounds {
    pub ingestion_rate: Option<f64>,
    pub ingestion_burst_size: Option<f64>,
    pub max_global_series_per_user: Option<f64>,
    pub max_samples_per_query: Option<f64>,
    pub max_query_lookback_secs: Option<f64>,
}

impl LimitBounds {
    pub fn from_raw(raw: &HashMap<String, LimitValue>) -> Result<Self> {
        let mut bounds = LimitBounds::default();
        for (key, value) in raw {
            match key.as_str() {
                "ingestion_rate" => bounds.ingestion_rate = Some(value.as_number(key)?),
                "ingestion_burst_size" => {
                    bounds.ingestion_burst_size = Some(value.as_number(key)?)
                }
                "max_global_series_per_user" => {
                    bounds.max_global_series_per_user = Some(value.as_number(key)?)
                }
                "max_samples_per_query" => {
                    bounds.max_samples_per_query = Some(value.as_number(key)?)
                }
                "max_query_lookback" => {
                    bounds.max_query_lookback_secs = Some(value.as_duration_secs(key)?)
                }
                other => {
                    if !KNOWN_LIMIT_FIELDS.contains(&other) {
                        bail!(
                            "unknown limit field '{other}'; expected one of {:?}",
                            KNOWN_LIMIT_FIELDS
                        );
                    }
                }
            }
        }
        Ok(bounds)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TierOverride {
    /// Replaces (does not add to) `controller.buffer_percentage` when present.
    pub buffer_percent: Option<f64>,
    pub min: Option<LimitBounds>,
    pub max: Option<LimitBounds>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTierOverride {
    buffer_percent: Option<f64>,
    min: Option<HashMap<String, LimitValue>>,
    max: Option<HashMap<String, LimitValue>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawLimitsConfig {
    min: HashMap<String, LimitValue>,
    max: HashMap<String, LimitValue>,
    tenant_tiers: HashMap<String, RawTierOverride>,
}

impl Default for RawLimitsConfig {
    fn default() -> Self {
        Self {
            min: HashMap::new(),
            max: HashMap::new(),
            tenant_tiers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LimitsConfig {
    pub min: LimitBounds,
    pub max: LimitBounds,
    pub tenant_tiers: HashMap<String, TierOverride>,
}

impl LimitsConfig {
    fn from_raw(raw: RawLimitsConfig) -> Result<Self> {
        let min = LimitBounds::from_raw(&raw.min)?;
        let max = LimitBounds::from_raw(&raw.max)?;
        let mut tenant_tiers = HashMap::with_capacity(raw.tenant_tiers.len());
        for (tier, raw_tier) in raw.tenant_tiers {
            let min = match &raw_tier.min {
                Some(m) => Some(LimitBounds::from_raw(m)?),
                None => None,
            };
            let max = match &raw_tier.max {
                Some(m) => Some(LimitBounds::from_raw(m)?),
                None => None,
            };
            tenant_tiers.insert(
                tier,
                TierOverride {
                    buffer_percent: raw_tier.buffer_percent,
                    min,
                    max,
                },
            );
        }
        Ok(Self {
            min,
            max,
            tenant_tiers,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub trigger_rollout: bool,
    pub components: Vec<String>,
    pub annotation_key: String,
    #[serde(with = "humantime_serde")]
    pub trigger_deadline: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            trigger_rollout: false,
            components: Vec::new(),
            annotation_key: "quotawarden.io/restartedAt".to_string(),
            trigger_deadline: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub error_rate_threshold: f64,
    pub blast_ceiling: f64,
    #[serde(with = "humantime_serde")]
    pub observation_window: Duration,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_rate_threshold: 0.5,
            blast_ceiling: 1_000_000.0,
            observation_window: Duration::from_secs(5 * 60),
            cooldown: Duration::from_secs(2 * 60),
            max_cooldown: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub cas_deadline: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay: Duration::from_millis(200),
            cas_deadline: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub listen_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub discovery: DiscoveryConfig,
    pub analysis: AnalysisConfig,
    pub spike: SpikeConfig,
    #[serde(skip)]
    pub limits: LimitsConfig,
    #[serde(rename = "limits")]
    raw_limits: RawLimitsConfig,
    pub rollout: RolloutConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub publisher: PublisherConfig,
    pub observability: ObservabilityConfig,
    /// When set, the collector generates deterministic synthetic samples
    /// instead of scraping. Never combined with real scrape in one process.
    pub synthetic: Option<SyntheticConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyntheticConfig {
    pub seed: u64,
    pub tenant_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            discovery: DiscoveryConfig::default(),
            analysis: AnalysisConfig::default(),
            spike: SpikeConfig::default(),
            limits: LimitsConfig::default(),
            raw_limits: RawLimitsConfig::default(),
            rollout: RolloutConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            publisher: PublisherConfig::default(),
            observability: ObservabilityConfig::default(),
            synthetic: None,
        }
    }
}

impl Config {
    /// Parse from YAML text and resolve the dynamic limit-value maps into
    /// validated `LimitBounds`. Rejects unknown limit-field keys and leaves
    /// of the wrong shape (e.g. a duration string where a number is expected).
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut cfg: Config =
            serde_yaml::from_str(text).context("parsing controller configuration")?;
        cfg.limits = LimitsConfig::from_raw(cfg.raw_limits.clone())
            .context("validating limits configuration")?;
        Ok(cfg)
    }

    pub fn eviction_horizon(&self) -> Duration {
        self.analysis.analysis_window * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_empty_document() {
        let cfg = Config::from_yaml("").unwrap();
        assert_eq!(cfg.controller.mode, ControllerMode::DryRun);
        assert_eq!(cfg.analysis.percentile, 95.0);
        assert_eq!(cfg.limits.min.ingestion_rate, None);
    }

    #[test]
    fn rejects_unknown_limit_field() {
        let yaml = r#"
limits:
  min:
    ingestion_rate: 100
    bogus_field: 5
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("unknown limit field"));
    }

    #[test]
    fn rejects_duration_leaf_for_numeric_field() {
        let yaml = r#"
limits:
  min:
    ingestion_rate: "5m"
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("expects a number"));
    }

    #[test]
    fn parses_duration_leaf_for_lookback() {
        let yaml = r#"
limits:
  max:
    max_query_lookback: "720h"
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.limits.max.max_query_lookback_secs, Some(720.0 * 3600.0));
    }

    #[test]
    fn tier_buffer_replaces_not_adds() {
        let yaml = r#"
limits:
  tenant_tiers:
    gold:
      buffer_percent: 50
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        let tier = cfg.limits.tenant_tiers.get("gold").unwrap();
        assert_eq!(tier.buffer_percent, Some(50.0));
    }
}
