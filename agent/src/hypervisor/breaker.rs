//! Circuit breaker guarding the hypervisor connection.
//!
//! Closed: outcomes are recorded into a rolling window; once the window
//! holds at least `min_requests` with a failure ratio at or above
//! `failure_ratio`, the breaker opens. Open: calls fail fast without
//! touching the hypervisor until `open_for` elapses. Half-open: up to
//! `half_open_probes` calls are admitted; the first success closes the
//! breaker, any failure re-opens it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling window over which the failure ratio is computed.
    pub window: Duration,
    /// Minimum requests in the window before the breaker may trip.
    pub min_requests: u32,
    /// Failure ratio at which the breaker trips.
    pub failure_ratio: f64,
    /// How long the breaker stays open before probing.
    pub open_for: Duration,
    /// Probe calls admitted while half-open.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_requests: 3,
            failure_ratio: 0.6,
            open_for: Duration::from_secs(30),
            half_open_probes: 3,
        }
    }
}

#[derive(Debug)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { probes_issued: u32 },
}

struct Inner {
    state: State,
    /// (when, succeeded) per request, pruned to the window.
    outcomes: VecDeque<(Instant, bool)>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// Gate a call. `Ok` admits it; `Err` is the fail-fast rejection.
    pub fn check(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => Ok(()),
            State::Open { until } => {
                if Instant::now() >= until {
                    inner.state = State::HalfOpen { probes_issued: 1 };
                    Ok(())
                } else {
                    Err(AgentError::HypervisorUnavailable(
                        "hypervisor circuit breaker is open".into(),
                    ))
                }
            }
            State::HalfOpen { probes_issued } => {
                if probes_issued < self.config.half_open_probes {
                    inner.state = State::HalfOpen {
                        probes_issued: probes_issued + 1,
                    };
                    Ok(())
                } else {
                    Err(AgentError::HypervisorUnavailable(
                        "hypervisor circuit breaker is probing".into(),
                    ))
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&self, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.outcomes.push_back((now, success));
                while let Some(&(at, _)) = inner.outcomes.front() {
                    if now.duration_since(at) > self.config.window {
                        inner.outcomes.pop_front();
                    } else {
                        break;
                    }
                }
                let total = inner.outcomes.len() as u32;
                let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count() as f64;
                if total >= self.config.min_requests
                    && failures / f64::from(total) >= self.config.failure_ratio
                {
                    warn!(
                        requests = total,
                        failures = failures as u32,
                        "hypervisor circuit breaker opened"
                    );
                    inner.outcomes.clear();
                    inner.state = State::Open {
                        until: now + self.config.open_for,
                    };
                }
            }
            State::HalfOpen { .. } => {
                if success {
                    inner.state = State::Closed;
                    inner.outcomes.clear();
                } else {
                    warn!("hypervisor circuit breaker re-opened after failed probe");
                    inner.state = State::Open {
                        until: now + self.config.open_for,
                    };
                }
            }
            // A late record after the breaker opened; nothing to count.
            State::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            window: Duration::from_secs(60),
            min_requests: 3,
            failure_ratio: 0.6,
            open_for: Duration::from_millis(20),
            half_open_probes: 3,
        }
    }

    fn drive(breaker: &CircuitBreaker, success: bool) -> bool {
        match breaker.check() {
            Ok(()) => {
                breaker.record(success);
                true
            }
            Err(_) => false,
        }
    }

    #[test]
    fn trips_after_three_consecutive_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        assert!(drive(&breaker, false));
        assert!(drive(&breaker, false));
        assert!(drive(&breaker, false));
        // Open now: fails fast.
        assert!(matches!(
            breaker.check(),
            Err(AgentError::HypervisorUnavailable(_))
        ));
    }

    #[test]
    fn stays_closed_below_min_requests() {
        let breaker = CircuitBreaker::new(fast_config());
        assert!(drive(&breaker, false));
        assert!(drive(&breaker, false));
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn stays_closed_below_failure_ratio() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..4 {
            assert!(drive(&breaker, true));
        }
        // 2 failures over 6 requests is a third, under the 0.6 ratio.
        assert!(drive(&breaker, false));
        assert!(drive(&breaker, false));
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            drive(&breaker, false);
        }
        assert!(breaker.check().is_err());

        std::thread::sleep(Duration::from_millis(25));
        // First probe admitted, succeeds, breaker closes.
        assert!(drive(&breaker, true));
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            drive(&breaker, false);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(drive(&breaker, false));
        assert!(matches!(
            breaker.check(),
            Err(AgentError::HypervisorUnavailable(_))
        ));
    }

    #[test]
    fn half_open_caps_probe_count() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            drive(&breaker, false);
        }
        std::thread::sleep(Duration::from_millis(25));
        // Admit three probes without recording outcomes.
        assert!(breaker.check().is_ok());
        assert!(breaker.check().is_ok());
        assert!(breaker.check().is_ok());
        // Fourth concurrent probe is rejected.
        assert!(breaker.check().is_err());
    }
}
