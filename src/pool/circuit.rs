//! Circuit breaker guarding connection acquisition
//!
//! Each pool owns one breaker with three states:
//! - Closed: normal operation, acquires proceed
//! - Open: too many consecutive failures, acquires fail fast
//! - HalfOpen: cooldown elapsed, a single probe acquire is let through
//!
//! The breaker has no lock of its own. It lives inside the pool state and
//! is only touched while the pool's lock is held.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit breaker is open, retry in {0:?}")]
    CircuitOpen(Duration),

    #[error("Half-open circuit is already probing")]
    ProbeInFlight,
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Too many failures - requests are rejected
    Open {
        /// When the circuit may move to HalfOpen
        retry_at: Instant,
    },

    /// Testing recovery - one probe request allowed
    HalfOpen,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// How a request was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Normal,
    /// Circuit half-open; the caller owns the single probe and must report
    /// its outcome or abandon it
    Probe,
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub state: CircuitState,
    /// Consecutive failures since the last reset
    pub failures: u32,
    pub last_failure_at: Option<Instant>,
    /// Number of times the circuit has opened
    pub open_count: u64,
    /// Time since last state transition
    pub time_in_state: Duration,
}

/// Per-pool circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    threshold: u32,
    timeout: Duration,
    failures: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
    open_count: u64,
    last_transition: Instant,
}

impl CircuitBreaker {
    /// Create a closed breaker that opens after `threshold` consecutive
    /// failures and probes again `timeout` after the last failure
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            threshold: threshold.max(1),
            timeout,
            failures: 0,
            last_failure_at: None,
            probe_in_flight: false,
            open_count: 0,
            last_transition: Instant::now(),
        }
    }

    /// Apply new thresholds; the current state is kept
    pub fn reconfigure(&mut self, threshold: u32, timeout: Duration) {
        self.threshold = threshold.max(1);
        self.timeout = timeout;
        if let CircuitState::Open { .. } = self.state {
            self.state = CircuitState::Open {
                retry_at: self.retry_at(),
            };
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn open_count(&self) -> u64 {
        self.open_count
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, CircuitState::Closed)
    }

    /// Open and still cooling down
    pub fn is_open(&self) -> bool {
        match self.state {
            CircuitState::Open { retry_at } => Instant::now() < retry_at,
            _ => false,
        }
    }

    /// Check if a request is allowed, moving Open to HalfOpen once the
    /// cooldown has elapsed
    pub fn check_request(&mut self) -> Result<Admission, CircuitError> {
        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),

            CircuitState::Open { retry_at } => {
                let now = Instant::now();
                if now >= retry_at {
                    info!("Circuit transitioning from open to half-open");
                    self.transition_to_half_open();
                    self.probe_in_flight = true;
                    Ok(Admission::Probe)
                } else {
                    Err(CircuitError::CircuitOpen(retry_at.saturating_duration_since(now)))
                }
            }

            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(CircuitError::ProbeInFlight)
                } else {
                    self.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Record a successful acquire or connection creation
    pub fn record_success(&mut self) {
        self.failures = 0;

        match self.state {
            CircuitState::Closed => {}

            CircuitState::HalfOpen => {
                info!("Probe succeeded, circuit transitioning from half-open to closed");
                self.transition_to_closed();
            }

            CircuitState::Open { .. } => {
                // A connection created before the circuit opened finished late
                debug!("Recorded success in open state");
            }
        }
    }

    /// Record a failed acquire or connection creation.
    ///
    /// Returns true when this failure opened the circuit.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.last_failure_at = Some(Instant::now());

        match self.state {
            CircuitState::Closed => {
                debug!(
                    failures = self.failures,
                    threshold = self.threshold,
                    "Failure recorded in closed state"
                );

                if self.failures >= self.threshold {
                    warn!(
                        failures = self.failures,
                        "Circuit transitioning from closed to open"
                    );
                    self.transition_to_open();
                    return true;
                }
                false
            }

            CircuitState::HalfOpen => {
                warn!("Probe failed, circuit transitioning from half-open to open");
                self.transition_to_open();
                true
            }

            CircuitState::Open { .. } => {
                // Restart the cooldown from this failure
                self.state = CircuitState::Open {
                    retry_at: self.retry_at(),
                };
                false
            }
        }
    }

    /// Give back a probe whose acquire was cancelled before it produced an
    /// outcome, so another caller can probe
    pub fn abandon_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// Manually reset to closed
    pub fn reset(&mut self) {
        self.transition_to_closed();
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            failures: self.failures,
            last_failure_at: self.last_failure_at,
            open_count: self.open_count,
            time_in_state: self.last_transition.elapsed(),
        }
    }

    fn retry_at(&self) -> Instant {
        self.last_failure_at.unwrap_or_else(Instant::now) + self.timeout
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.probe_in_flight = false;
        self.last_transition = Instant::now();
    }

    fn transition_to_open(&mut self) {
        self.state = CircuitState::Open {
            retry_at: self.retry_at(),
        };
        self.probe_in_flight = false;
        self.open_count += 1;
        self.last_transition = Instant::now();
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.last_transition = Instant::now();
    }
}
