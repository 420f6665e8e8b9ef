use chrono::{DateTime, Utc};
use keystone_core::{KeystoneError, KeystoneResult, SharedClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive backend failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is admitted.
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 10_000,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without reaching the backend.
    Open,
    /// One probe call is in flight; others are rejected.
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { until: DateTime<Utc> },
    HalfOpen { probe_started: DateTime<Utc> },
}

/// Fails fast after repeated backend failures until a cooldown elapses and
/// a probe succeeds.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.config.cooldown_ms as i64)
    }

    /// Admit or reject a call.
    ///
    /// When the cooldown has elapsed the first caller becomes the probe and
    /// the breaker moves to half-open. A probe that never reports back is
    /// replaced after another cooldown.
    pub fn admit(&self) -> KeystoneResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let current = *inner;
        match current {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { until } if now >= until => {
                info!("Circuit breaker half-open, admitting probe");
                *inner = Inner::HalfOpen { probe_started: now };
                Ok(())
            }
            Inner::Open { until } => Err(KeystoneError::CircuitOpen {
                retry_in_ms: (until - now).num_milliseconds().max(0) as u64,
            }),
            Inner::HalfOpen { probe_started } if now >= probe_started + self.cooldown() => {
                *inner = Inner::HalfOpen { probe_started: now };
                Ok(())
            }
            Inner::HalfOpen { probe_started } => Err(KeystoneError::CircuitOpen {
                retry_in_ms: (probe_started + self.cooldown() - now)
                    .num_milliseconds()
                    .max(0) as u64,
            }),
        }
    }

    /// Report a successful backend call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if !matches!(*inner, Inner::Closed { .. }) {
            info!("Circuit breaker closed");
        }
        *inner = Inner::Closed {
            consecutive_failures: 0,
        };
    }

    /// Report a failed backend call.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let current = *inner;
        let open = match current {
            Inner::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    true
                } else {
                    *inner = Inner::Closed {
                        consecutive_failures: failures,
                    };
                    false
                }
            }
            Inner::HalfOpen { .. } | Inner::Open { .. } => true,
        };
        if open {
            warn!(
                cooldown_ms = self.config.cooldown_ms,
                "Circuit breaker opened after backend failures"
            );
            *inner = Inner::Open {
                until: now + self.cooldown(),
            };
        }
    }

    /// Current state, for diagnostics.
    pub fn state(&self) -> CircuitState {
        match *self.inner.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use keystone_core::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn breaker(threshold: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown_ms: 1_000,
            },
            clock.clone(),
        );
        (breaker, clock)
    }

    #[test]
    fn test_opens_after_threshold() {
        let (breaker, _clock) = breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.admit().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        let err = breaker.admit().unwrap_err();
        assert!(matches!(err, KeystoneError::CircuitOpen { retry_in_ms: 1_000 }));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (breaker, _clock) = breaker(2);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_on_success() {
        let (breaker, clock) = breaker(1);
        breaker.record_failure();
        assert!(breaker.admit().is_err());

        clock.advance(Duration::from_millis(1_000));
        assert!(breaker.admit().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // A second caller is rejected while the probe is in flight.
        assert!(breaker.admit().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.admit().is_ok());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let (breaker, clock) = breaker(1);
        breaker.record_failure();
        clock.advance(Duration::from_millis(1_500));
        assert!(breaker.admit().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.admit().is_err());
    }

    #[test]
    fn test_abandoned_probe_is_replaced() {
        let (breaker, clock) = breaker(1);
        breaker.record_failure();
        clock.advance(Duration::from_millis(1_000));
        assert!(breaker.admit().is_ok());
        clock.advance(Duration::from_millis(1_000));
        assert!(breaker.admit().is_ok());
    }
}
