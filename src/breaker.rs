//! Per-upstream circuit breaker guarding browser acquisition.
//!
//! Consecutive counted failures trip the circuit; while open, renders are
//! rejected without touching the pool. After the reset window one probe is
//! admitted: its success closes the circuit, its failure re-opens it with a
//! fresh stamp. Timestamps use the tokio clock so tests can drive the reset
//! window with a paused runtime.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Consecutive counted failures before the circuit opens.
    pub fail_max: u32,
    /// How long the circuit stays open before admitting a probe.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_max: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Externally visible circuit phase, surfaced on the status endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug)]
enum CircuitState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(CircuitState::Closed { failures: 0 }),
        }
    }

    /// Gate check before acquiring a page. Returns `false` while the circuit
    /// is open or a probe is already in flight.
    pub fn admit(&self) -> bool {
        if !self.cfg.enabled {
            return true;
        }
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed { .. } => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.cfg.reset_timeout {
                    info!(target: "breaker", "reset window elapsed, admitting probe");
                    *state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // The single probe was already admitted.
            CircuitState::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        if !self.cfg.enabled {
            return;
        }
        let mut state = self.state.lock();
        match *state {
            CircuitState::HalfOpen => {
                info!(target: "breaker", "probe succeeded, circuit closed");
                *state = CircuitState::Closed { failures: 0 };
            }
            CircuitState::Closed { ref mut failures } => *failures = 0,
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.cfg.enabled {
            return;
        }
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed { ref mut failures } => {
                *failures += 1;
                if *failures >= self.cfg.fail_max {
                    warn!(
                        target: "breaker",
                        failures = *failures,
                        "failure threshold reached, circuit open"
                    );
                    *state = CircuitState::Open {
                        since: Instant::now(),
                    };
                }
            }
            CircuitState::HalfOpen => {
                warn!(target: "breaker", "probe failed, circuit re-opened");
                *state = CircuitState::Open {
                    since: Instant::now(),
                };
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn phase(&self) -> BreakerPhase {
        match *self.state.lock() {
            CircuitState::Closed { .. } => BreakerPhase::Closed,
            CircuitState::Open { .. } => BreakerPhase::Open,
            CircuitState::HalfOpen => BreakerPhase::HalfOpen,
        }
    }
}

/// One breaker per upstream key (the browser endpoint).
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            breakers: DashMap::new(),
        }
    }

    pub fn for_upstream(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.cfg)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(fail_max: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            enabled: true,
            fail_max,
            reset_timeout: reset,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(60));
        for _ in 0..2 {
            assert!(breaker.admit());
            breaker.record_failure();
        }
        assert_eq!(breaker.phase(), BreakerPhase::Closed);

        assert!(breaker.admit());
        breaker.record_failure();
        assert_eq!(breaker.phase(), BreakerPhase::Open);
        assert!(!breaker.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_consecutive_count() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.phase(), BreakerPhase::Closed);
        assert!(breaker.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_admitted_after_reset_window_and_closes_on_success() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.record_failure();
        assert!(!breaker.admit());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.admit());
        assert_eq!(breaker.phase(), BreakerPhase::HalfOpen);
        // Only one probe gets through.
        assert!(!breaker.admit());

        breaker.record_success();
        assert_eq!(breaker.phase(), BreakerPhase::Closed);
        assert!(breaker.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_with_fresh_stamp() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.admit());
        breaker.record_failure();
        assert_eq!(breaker.phase(), BreakerPhase::Open);

        // The stamp was refreshed: half the window is not enough.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.admit());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_breaker_admits_everything() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            enabled: false,
            ..BreakerConfig::default()
        });
        for _ in 0..100 {
            breaker.record_failure();
            assert!(breaker.admit());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registry_hands_out_one_breaker_per_key() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.for_upstream("localhost:9222");
        let b = registry.for_upstream("localhost:9222");
        let c = registry.for_upstream("other:9222");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
