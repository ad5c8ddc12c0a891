//! Circuit breaker guarding calls to the embedding provider.
//!
//! ```text
//!   Closed --(N consecutive failures)--> Open --(cooldown elapsed)--> HalfOpen
//!     ^                                   ^                              |
//!     |                                   +--------(probe fails)---------+
//!     +---------------------------(probe succeeds)-----------------------+
//! ```
//!
//! While half-open exactly one caller holds the probe permit; everyone else is
//! rejected as if the circuit were still open.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// What the caller may do after [`CircuitBreaker::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Circuit closed, call normally
    Call,
    /// Caller is the single half-open probe
    Probe,
    /// Circuit open; retry after the given time
    Rejected { remaining: Duration },
}

/// Serializable view of the breaker, for status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Milliseconds until a probe is allowed, when open
    pub reopens_in_ms: Option<u64>,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant, failures: u32 },
    /// `probe_started` is set while a probe call is outstanding
    HalfOpen {
        probe_started: Option<Instant>,
        failures: u32,
    },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The state is always left consistent, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask for permission to call the provider.
    pub fn acquire(&self) -> Permit {
        let mut inner = self.lock();
        let now = Instant::now();
        match *inner {
            Inner::Closed { .. } => Permit::Call,
            Inner::Open { until, failures } => {
                if now >= until {
                    tracing::info!("Circuit cooldown elapsed, allowing a probe call");
                    *inner = Inner::HalfOpen {
                        probe_started: Some(now),
                        failures,
                    };
                    Permit::Probe
                } else {
                    Permit::Rejected {
                        remaining: until - now,
                    }
                }
            }
            Inner::HalfOpen {
                probe_started: None,
                failures,
            } => {
                *inner = Inner::HalfOpen {
                    probe_started: Some(now),
                    failures,
                };
                Permit::Probe
            }
            Inner::HalfOpen {
                probe_started: Some(started),
                failures,
            } => {
                let deadline = started + self.config.cooldown;
                if now >= deadline {
                    // The probe holder never reported back
                    tracing::warn!(
                        "Probe call outstanding for {:?}, allowing another",
                        now - started
                    );
                    *inner = Inner::HalfOpen {
                        probe_started: Some(now),
                        failures,
                    };
                    Permit::Probe
                } else {
                    Permit::Rejected {
                        remaining: deadline - now,
                    }
                }
            }
        }
    }

    /// Give up an outstanding probe without an outcome, e.g. when the calling
    /// future was dropped. The circuit reopens for another cooldown.
    pub fn abandon_probe(&self) {
        let mut inner = self.lock();
        if let Inner::HalfOpen {
            probe_started: Some(_),
            failures,
        } = *inner
        {
            tracing::warn!("Probe call abandoned, reopening circuit");
            *inner = Inner::Open {
                until: Instant::now() + self.config.cooldown,
                failures,
            };
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if !matches!(*inner, Inner::Closed { .. }) {
            tracing::info!("Provider recovered, circuit closed");
        }
        *inner = Inner::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        let next = match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    tracing::warn!(
                        "Provider failed {} times in a row, opening circuit for {:?}",
                        failures,
                        self.config.cooldown
                    );
                    Inner::Open {
                        until: now + self.config.cooldown,
                        failures,
                    }
                } else {
                    Inner::Closed { failures }
                }
            }
            Inner::HalfOpen { failures, .. } => {
                tracing::warn!("Probe call failed, reopening circuit");
                Inner::Open {
                    until: now + self.config.cooldown,
                    failures: failures + 1,
                }
            }
            // A call that started before the circuit opened
            Inner::Open { until, failures } => Inner::Open {
                until,
                failures: failures + 1,
            },
        };
        *inner = next;
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        let (state, consecutive_failures, reopens_in_ms) = match *inner {
            Inner::Closed { failures } => (CircuitState::Closed, failures, None),
            Inner::Open { until, failures } => (
                CircuitState::Open,
                failures,
                Some(until.saturating_duration_since(now).as_millis() as u64),
            ),
            Inner::HalfOpen { failures, .. } => (CircuitState::HalfOpen, failures, None),
        };
        CircuitSnapshot {
            state,
            consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            reopens_in_ms,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}
