//! C5 — Spike Detector: a per (tenant, metric) hysteresis state machine that
//! decides whether the current window looks like a transient spike, and if
//! so, how much headroom multiplier to apply on top of the normal
//! recommendation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::collector::{Sample, TenantId, TrackedMetric};
use crate::config::SpikeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikeState {
    Quiescent,
    Active,
    Cooldown,
}

#[derive(Debug, Clone, Copy)]
struct TenantMetricState {
    state: SpikeState,
    multiplier: f64,
    cooldown_entered_at: Option<DateTime<Utc>>,
}

impl Default for TenantMetricState {
    fn default() -> Self {
        Self {
            state: SpikeState::Quiescent,
            multiplier: 1.0,
            cooldown_entered_at: None,
        }
    }
}

/// Minimum number of older-than-detection-window samples required before a
/// baseline is considered trustworthy. Below this, the detector stays
/// quiescent rather than risk a false spike off a thin baseline.
const MIN_BASELINE_SAMPLES: usize = 5;

#[derive(Debug, Default)]
pub struct SpikeDetector {
    states: HashMap<(TenantId, TrackedMetric), TenantMetricState>,
}

#[derive(Debug, Clone, Copy)]
pub struct SpikeDecision {
    pub active: bool,
    pub multiplier: f64,
    /// True exactly on the tick that transitions Active -> Cooldown, so the
    /// caller can emit the one-shot "spike-ended" audit event (§4.5).
    pub just_ended: bool,
}

impl SpikeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one (tenant, metric) window for this tick and return the
    /// decision to feed into the analyzer. `window` must be in non-decreasing
    /// timestamp order and span at least `2 * config.detection_window`
    /// worth of history to have a usable baseline.
    pub fn evaluate(
        &mut self,
        tenant: &str,
        metric: TrackedMetric,
        window: &[Sample],
        config: &SpikeConfig,
        now: DateTime<Utc>,
    ) -> SpikeDecision {
        if !config.enabled {
            return SpikeDecision {
                active: false,
                multiplier: 1.0,
                just_ended: false,
            };
        }

        let key = (tenant.to_string(), metric);
        let mut state = self.states.get(&key).copied().unwrap_or_default();
        let mut just_ended = false;

        let detection_window = chrono::Duration::from_std(config.detection_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let baseline_cutoff = now - detection_window * 2;
        let recent_cutoff = now - detection_window;

        let baseline_samples: Vec<&Sample> = window
            .iter()
            .filter(|s| s.timestamp < baseline_cutoff)
            .collect();
        let recent_samples: Vec<&Sample> = window
            .iter()
            .filter(|s| s.timestamp >= recent_cutoff)
            .collect();

        let baseline = if baseline_samples.len() >= MIN_BASELINE_SAMPLES {
            Some(baseline_samples.iter().map(|s| s.value).sum::<f64>() / baseline_samples.len() as f64)
        } else {
            None
        };

        let recent_avg = if recent_samples.is_empty() {
            None
        } else {
            Some(recent_samples.iter().map(|s| s.value).sum::<f64>() / recent_samples.len() as f64)
        };

        let ratio = match (baseline, recent_avg) {
            (Some(b), Some(r)) if b > 0.0 => Some(r / b),
            _ => None,
        };

        match state.state {
            SpikeState::Quiescent => {
                if let Some(ratio) = ratio {
                    if ratio > config.threshold {
                        state.state = SpikeState::Active;
                        state.multiplier = ratio.min(config.max_spike_multiplier);
                    }
                }
            }
            SpikeState::Active => {
                if let Some(ratio) = ratio {
                    if ratio <= config.threshold {
                        state.state = SpikeState::Cooldown;
                        state.cooldown_entered_at = Some(now);
                        just_ended = true;
                    } else {
                        state.multiplier = ratio.min(config.max_spike_multiplier);
                    }
                } else {
                    state.state = SpikeState::Cooldown;
                    state.cooldown_entered_at = Some(now);
                    just_ended = true;
                }
            }
            SpikeState::Cooldown => {
                let cooldown = chrono::Duration::from_std(config.cooldown_period)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let elapsed_ok = state
                    .cooldown_entered_at
                    .map(|at| now - at >= cooldown)
                    .unwrap_or(true);
                if elapsed_ok {
                    state.state = SpikeState::Quiescent;
                    state.multiplier = 1.0;
                    state.cooldown_entered_at = None;
                }
            }
        }

        // Re-clamp every tick regardless of transition, so a lowered
        // max-multiplier in config (or a circuit-breaker clamp) takes effect
        // immediately rather than waiting for the next state transition.
        state.multiplier = state.multiplier.min(config.max_spike_multiplier).max(1.0);

        let decision = SpikeDecision {
            active: state.state == SpikeState::Active,
            multiplier: if state.state == SpikeState::Quiescent {
                1.0
            } else {
                state.multiplier
            },
            just_ended,
        };
        self.states.insert(key, state);
        decision
    }

    /// Force every tracked multiplier down to at most `ceiling` (used by the
    /// circuit breaker when open, §9).
    pub fn clamp_all(&mut self, ceiling: f64) {
        for state in self.states.values_mut() {
            state.multiplier = state.multiplier.min(ceiling);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::time::Duration;

    fn config() -> SpikeConfig {
        SpikeConfig {
            enabled: true,
            threshold: 3.0,
            max_spike_multiplier: 4.0,
            detection_window: Duration::from_secs(600),
            cooldown_period: Duration::from_secs(300),
        }
    }

    fn sample(value: f64, offset_secs: i64, base: DateTime<Utc>) -> Sample {
        Sample {
            tenant: "t1".to_string(),
            metric: TrackedMetric::DistributorReceivedSamples,
            value,
            timestamp: base + chrono::Duration::seconds(offset_secs),
            source: "test".to_string(),
            labels: Map::new(),
        }
    }

    #[test]
    fn thin_baseline_stays_quiescent() {
        let mut detector = SpikeDetector::new();
        let now = Utc::now();
        let window = vec![sample(1000.0, -1200, now)];
        let decision = detector.evaluate("t1", TrackedMetric::DistributorReceivedSamples, &window, &config(), now);
        assert!(!decision.active);
        assert_eq!(decision.multiplier, 1.0);
    }

    #[test]
    fn onset_triggers_when_ratio_exceeds_threshold() {
        let mut detector = SpikeDetector::new();
        let now = Utc::now();
        let mut window = Vec::new();
        for i in 0..6 {
            window.push(sample(100.0, -1300 + i * 10, now));
        }
        for i in 0..3 {
            window.push(sample(1000.0, -100 + i * 10, now));
        }
        let decision = detector.evaluate("t1", TrackedMetric::DistributorReceivedSamples, &window, &config(), now);
        assert!(decision.active);
        assert!(decision.multiplier > 1.0);
        assert!(!decision.just_ended);
    }

    #[test]
    fn active_to_cooldown_transition_reports_just_ended_once() {
        let mut detector = SpikeDetector::new();
        let now = Utc::now();
        let mut window = Vec::new();
        for i in 0..6 {
            window.push(sample(100.0, -1300 + i * 10, now));
        }
        for i in 0..3 {
            window.push(sample(1000.0, -100 + i * 10, now));
        }
        let onset = detector.evaluate("t1", TrackedMetric::DistributorReceivedSamples, &window, &config(), now);
        assert!(onset.active && !onset.just_ended);

        let later = now + chrono::Duration::seconds(60);
        let mut settled = Vec::new();
        for i in 0..6 {
            settled.push(sample(100.0, -1300 + i * 10, later));
        }
        for i in 0..3 {
            settled.push(sample(100.0, -100 + i * 10, later));
        }
        let ended = detector.evaluate("t1", TrackedMetric::DistributorReceivedSamples, &settled, &config(), later);
        assert!(ended.just_ended);
        assert!(!ended.active);

        let steady = detector.evaluate("t1", TrackedMetric::DistributorReceivedSamples, &settled, &config(), later);
        assert!(!steady.just_ended);
    }

    #[test]
    fn clamp_all_immediately_lowers_tracked_multiplier() {
        let mut detector = SpikeDetector::new();
        let now = Utc::now();
        let mut window = Vec::new();
        for i in 0..6 {
            window.push(sample(100.0, -1300 + i * 10, now));
        }
        for i in 0..3 {
            window.push(sample(10_000.0, -100 + i * 10, now));
        }
        let before = detector.evaluate("t1", TrackedMetric::DistributorReceivedSamples, &window, &config(), now);
        assert!(before.multiplier > 1.0);

        detector.clamp_all(1.0);
        let tracked = detector
            .states
            .get(&("t1".to_string(), TrackedMetric::DistributorReceivedSamples))
            .unwrap();
        assert_eq!(tracked.multiplier, 1.0);
    }
}
