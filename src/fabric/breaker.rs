//! Circuit breaker.
//!
//! Three states: `Closed` counts consecutive failures and trips at the
//! configured budget; `Open` rejects immediately for a fixed window;
//! `HalfOpen` admits a bounded number of probes and closes again after
//! enough consecutive probe successes. The rejection path takes one short
//! lock and never touches the protected channel.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning, usually sourced from [`crate::config::FabricConfig`].
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_budget: u32,
    pub open_duration: Duration,
    pub probe_budget: u32,
    pub close_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_budget: 5,
            open_duration: Duration::from_secs(30),
            probe_budget: 3,
            close_successes: 2,
        }
    }
}

impl BreakerConfig {
    pub fn from_fabric(fabric: &crate::config::FabricConfig) -> Self {
        Self {
            failure_budget: fabric.breaker_failure_budget,
            open_duration: Duration::from_secs(fabric.breaker_open_secs),
            probe_budget: fabric.breaker_probe_budget,
            close_successes: fabric.breaker_close_successes,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
    last_transition: Instant,
}

/// Observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub probe_successes: u32,
    pub seconds_since_transition: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    /// Ask to pass one call through. While `Open` this rejects without
    /// invoking anything downstream; after the open window it admits
    /// bounded probes.
    pub fn try_acquire(&self) -> Result<(), crate::fabric::FabricError> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed =
                    inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_duration {
                    info!(breaker = %self.name, "breaker half-open, admitting probes");
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_in_flight = 1;
                    inner.probe_successes = 0;
                    inner.last_transition = Instant::now();
                    Ok(())
                } else {
                    Err(crate::fabric::FabricError::CircuitOpen { channel: self.name.clone() })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.config.probe_budget {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(crate::fabric::FabricError::CircuitOpen { channel: self.name.clone() })
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.close_successes {
                    info!(breaker = %self.name, "breaker closed");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.probes_in_flight = 0;
                    inner.probe_successes = 0;
                    inner.last_transition = Instant::now();
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_budget {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.last_transition = Instant::now();
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probes_in_flight = 0;
                inner.probe_successes = 0;
                inner.last_transition = Instant::now();
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock().expect("breaker lock");
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            probe_successes: inner.probe_successes,
            seconds_since_transition: inner.last_transition.elapsed().as_secs(),
        }
    }
}
