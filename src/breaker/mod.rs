//! C8 — Circuit Breaker: gates limit-increasing publishes when the
//! controller's own error rate or the scale of a proposed change looks
//! dangerous. Decreases (protective changes) are never inhibited.

use chrono::{DateTime, Utc};
use log::{error, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding for the `quotawarden_circuit_breaker_state` gauge.
    pub fn as_gauge_value(&self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    opened_at: Option<DateTime<Utc>>,
    current_cooldown: std::time::Duration,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            opened_at: None,
            current_cooldown: std::time::Duration::ZERO,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Feed the latest observation window's error rate and the largest
    /// proposed blast (e.g. total series delta across tenants this tick).
    /// Call once per reconcile tick, before deciding whether to allow
    /// increasing publishes. Returns `true` exactly on the tick that trips
    /// into `Open` (fresh or re-opened from `HalfOpen`), so the caller can
    /// emit the one-shot "panic" audit event (§4.8).
    pub fn observe(&mut self, error_rate: f64, blast: f64, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> bool {
        if !config.enabled {
            return false;
        }

        match self.state {
            BreakerState::Closed => {
                if error_rate > config.error_rate_threshold || blast > config.blast_ceiling {
                    error!(
                        "circuit breaker opening: error_rate={error_rate:.3} (threshold {}), blast={blast} (ceiling {})",
                        config.error_rate_threshold, config.blast_ceiling
                    );
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    self.current_cooldown = config.cooldown;
                    return true;
                }
            }
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .and_then(|at| chrono::Duration::from_std(self.current_cooldown).ok().map(|c| (at, c)))
                    .map(|(at, c)| now - at >= c)
                    .unwrap_or(false);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                }
            }
            BreakerState::HalfOpen => {
                if error_rate > config.error_rate_threshold || blast > config.blast_ceiling {
                    warn!("circuit breaker trial reconcile failed; reopening with doubled cooldown");
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    self.current_cooldown = (self.current_cooldown * 2).min(config.max_cooldown);
                    return true;
                } else {
                    self.state = BreakerState::Closed;
                    self.current_cooldown = std::time::Duration::ZERO;
                }
            }
        }
        false
    }

    /// Whether a limit-increasing change is allowed to publish this tick.
    /// Decreases are always allowed regardless of state.
    pub fn allow_increase(&self) -> bool {
        self.state != BreakerState::Open
    }

    /// Spike multiplier ceiling to enforce while the breaker isn't closed.
    pub fn spike_multiplier_ceiling(&self) -> f64 {
        match self.state {
            BreakerState::Open => 1.0,
            _ => f64::INFINITY,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            error_rate_threshold: 0.5,
            blast_ceiling: 1000.0,
            observation_window: std::time::Duration::from_secs(300),
            cooldown: std::time::Duration::from_secs(60),
            max_cooldown: std::time::Duration::from_secs(600),
        }
    }

    #[test]
    fn stays_closed_under_threshold() {
        let mut breaker = CircuitBreaker::new();
        breaker.observe(0.1, 10.0, &config(), Utc::now());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_increase());
    }

    #[test]
    fn opens_on_high_error_rate_and_blocks_increases() {
        let mut breaker = CircuitBreaker::new();
        breaker.observe(0.9, 0.0, &config(), Utc::now());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_increase());
        assert_eq!(breaker.spike_multiplier_ceiling(), 1.0);
    }

    #[test]
    fn half_open_after_cooldown_then_recloses_on_success() {
        let mut breaker = CircuitBreaker::new();
        let t0 = Utc::now();
        breaker.observe(0.9, 0.0, &config(), t0);
        assert_eq!(breaker.state(), BreakerState::Open);

        let t1 = t0 + chrono::Duration::seconds(120);
        breaker.observe(0.9, 0.0, &config(), t1);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.observe(0.0, 0.0, &config(), t1);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_doubles_cooldown_on_repeat_failure() {
        let mut breaker = CircuitBreaker::new();
        let t0 = Utc::now();
        breaker.observe(0.9, 0.0, &config(), t0);
        let t1 = t0 + chrono::Duration::seconds(120);
        breaker.observe(0.9, 0.0, &config(), t1);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.observe(0.9, 0.0, &config(), t1);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.current_cooldown, std::time::Duration::from_secs(120));
    }
}
