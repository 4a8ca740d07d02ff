//! Circuit breaker implementation for fault tolerance
//!
//! This module implements a circuit breaker pattern with three states:
//! - Closed: Normal operation, requests are allowed
//! - Open: The database is failing, requests are rejected without a connection attempt
//! - HalfOpen: Testing recovery, a limited number of trial requests allowed
//!
//! One breaker guards one pool and reflects aggregate backend health. It owns
//! no timer: every transition happens on the calling path when the state is
//! checked or an outcome is recorded.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit breaker is open after {failure_count} consecutive failures, retry in {retry_in:?}")]
    Open {
        failure_count: u32,
        retry_in: Duration,
    },

    #[error("Half-open circuit has reached maximum trial requests ({failure_count} failures before recovery)")]
    HalfOpenLimitReached {
        failure_count: u32,
        /// Worst case: a failing trial reopens the circuit for a full recovery window
        retry_in: Duration,
    },
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Backend has failed - requests are rejected
    Open {
        /// When the circuit may transition to HalfOpen (`None` while forced open)
        retry_at: Option<Instant>,

        /// Number of consecutive failures that caused the circuit to open
        failure_count: u32,
    },

    /// Testing recovery - limited requests allowed
    HalfOpen {
        /// Number of successful trials in half-open state
        success_count: u32,

        /// Trials admitted but not yet resolved
        in_flight: u32,
    },
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen { .. } => "HalfOpen",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long to stay open before admitting trial requests
    #[serde(default = "default_recovery_time_ms")]
    pub recovery_time_ms: u64,

    /// Number of trial successes to close the circuit from half-open
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_time_ms() -> u64 {
    30_000
}

fn default_half_open_successes() -> u32 {
    2
}

impl CircuitBreakerConfig {
    pub fn recovery_time(&self) -> Duration {
        Duration::from_millis(self.recovery_time_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_time_ms: default_recovery_time_ms(),
            half_open_successes: default_half_open_successes(),
        }
    }
}

/// Circuit state and lifetime counters
struct CircuitInner {
    state: CircuitState,

    /// Consecutive failure count
    consecutive_failures: u32,

    total_requests: u64,
    total_rejected: u64,
    total_successes: u64,
    total_failures: u64,

    /// Last state transition time
    last_transition: Instant,

    /// Number of times the circuit has opened
    open_count: u64,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_requests: 0,
            total_rejected: 0,
            total_successes: 0,
            total_failures: 0,
            last_transition: Instant::now(),
            open_count: 0,
        }
    }

    fn check_request(&mut self, config: &CircuitBreakerConfig) -> Result<(), CircuitError> {
        self.total_requests += 1;

        match self.state {
            CircuitState::Closed => Ok(()),

            CircuitState::Open { retry_at, failure_count } => {
                let now = Instant::now();
                match retry_at {
                    Some(at) if now >= at => {
                        info!("Circuit transitioning from Open to HalfOpen");
                        self.transition_to_half_open();
                        self.admit_trial();
                        Ok(())
                    }
                    _ => {
                        self.total_rejected += 1;
                        Err(CircuitError::Open {
                            failure_count,
                            retry_in: retry_at
                                .map(|at| at.saturating_duration_since(now))
                                .unwrap_or(config.recovery_time()),
                        })
                    }
                }
            }

            CircuitState::HalfOpen { success_count, in_flight } => {
                // Admit only as many trials as are still needed to close
                if success_count + in_flight >= config.half_open_successes {
                    self.total_rejected += 1;
                    Err(CircuitError::HalfOpenLimitReached {
                        failure_count: self.consecutive_failures,
                        retry_in: config.recovery_time(),
                    })
                } else {
                    self.admit_trial();
                    Ok(())
                }
            }
        }
    }

    fn admit_trial(&mut self) {
        if let CircuitState::HalfOpen { in_flight, .. } = &mut self.state {
            *in_flight += 1;
        }
    }

    fn record_success(&mut self, config: &CircuitBreakerConfig) {
        self.total_successes += 1;
        self.consecutive_failures = 0;

        match self.state {
            CircuitState::Closed => {}

            CircuitState::Open { .. } => {
                // A request admitted before the circuit opened finished late
                debug!("Recorded success in Open state");
            }

            CircuitState::HalfOpen { success_count, in_flight } => {
                let new_success_count = success_count + 1;
                debug!(success_count = new_success_count, "Trial request succeeded in HalfOpen state");

                if new_success_count >= config.half_open_successes {
                    info!(success_count = new_success_count, "Circuit transitioning from HalfOpen to Closed");
                    self.transition_to_closed();
                } else {
                    self.state = CircuitState::HalfOpen {
                        success_count: new_success_count,
                        in_flight: in_flight.saturating_sub(1),
                    };
                }
            }
        }
    }

    fn record_failure(&mut self, config: &CircuitBreakerConfig) {
        self.total_failures += 1;
        self.consecutive_failures += 1;

        match self.state {
            CircuitState::Closed => {
                debug!(
                    consecutive_failures = self.consecutive_failures,
                    threshold = config.failure_threshold,
                    "Request failed in Closed state"
                );

                if self.consecutive_failures >= config.failure_threshold {
                    warn!(
                        consecutive_failures = self.consecutive_failures,
                        recovery_ms = config.recovery_time_ms,
                        "Circuit transitioning from Closed to Open"
                    );
                    self.transition_to_open(Some(config.recovery_time()));
                }
            }

            CircuitState::Open { .. } => {
                debug!("Request failed in Open state");
            }

            CircuitState::HalfOpen { success_count, .. } => {
                warn!(success_count, "Trial request failed in HalfOpen state - reopening circuit");
                self.transition_to_open(Some(config.recovery_time()));
            }
        }
    }

    fn abandon_trial(&mut self) {
        if let CircuitState::HalfOpen { in_flight, .. } = &mut self.state {
            *in_flight = in_flight.saturating_sub(1);
        }
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_transition = Instant::now();
    }

    fn transition_to_open(&mut self, recovery: Option<Duration>) {
        let now = Instant::now();
        self.state = CircuitState::Open {
            retry_at: recovery.map(|r| now + r),
            failure_count: self.consecutive_failures,
        };
        self.open_count += 1;
        self.last_transition = now;
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen {
            success_count: 0,
            in_flight: 0,
        };
        self.last_transition = Instant::now();
    }

    fn error_rate(&self) -> f64 {
        let resolved = self.total_successes + self.total_failures;
        if resolved == 0 {
            return 0.0;
        }
        self.total_failures as f64 / resolved as f64
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    /// Current state name
    pub state: &'static str,

    /// Consecutive failures
    pub failure_count: u32,

    pub total_requests: u64,
    pub total_rejected: u64,
    pub total_successes: u64,
    pub total_failures: u64,

    /// Failures over resolved requests
    pub error_rate: f64,

    /// Number of times circuit has opened
    pub open_count: u64,

    /// Time since last state transition
    pub time_in_state: Duration,

    /// Remaining time until the next trial window, while open
    pub retry_in: Option<Duration>,
}

/// Three-state admission policy guarding a database pool
pub struct CircuitBreaker {
    inner: Mutex<CircuitInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(CircuitInner::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a new attempt may proceed
    ///
    /// Advances Open to HalfOpen once the recovery time has elapsed. A
    /// rejection carries the failure count and the time left until recovery.
    pub fn check_request(&self) -> Result<(), CircuitError> {
        self.inner.lock().check_request(&self.config)
    }

    pub fn allow_request(&self) -> bool {
        self.check_request().is_ok()
    }

    pub fn record_success(&self) {
        self.inner.lock().record_success(&self.config);
    }

    pub fn record_failure(&self) {
        self.inner.lock().record_failure(&self.config);
    }

    /// Release an admitted trial that ended without touching the database
    pub fn abandon(&self) {
        self.inner.lock().abandon_trial();
    }

    /// Open the circuit until [`reset`](Self::reset) is called
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        info!("Circuit forced open");
        inner.transition_to_open(None);
    }

    /// Return to Closed with counters zeroed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!("Manually resetting circuit to Closed");
        inner.transition_to_closed();
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state.clone()
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Check if the circuit is closed
    pub fn is_healthy(&self) -> bool {
        matches!(self.inner.lock().state, CircuitState::Closed)
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        let retry_in = match inner.state {
            CircuitState::Open { retry_at: Some(at), .. } => Some(at.saturating_duration_since(Instant::now())),
            _ => None,
        };
        CircuitStats {
            state: inner.state.name(),
            failure_count: inner.consecutive_failures,
            total_requests: inner.total_requests,
            total_rejected: inner.total_rejected,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            error_rate: inner.error_rate(),
            open_count: inner.open_count,
            time_in_state: inner.last_transition.elapsed(),
            retry_in,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
