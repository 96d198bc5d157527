//! Circuit breakers for the pipeline's external dependencies.
//!
//! One breaker per dependency (classification service, accounting system,
//! mail transport), held in a [`BreakerRegistry`] that is built once at
//! startup and shared with the executor. Breakers are never global and
//! never shared across dependencies.
//!
//! State transitions:
//!
//! ```text
//! closed --[failure_threshold consecutive failures]--> open
//! open --[recovery_timeout elapsed, observed lazily]--> half_open
//! half_open --[trial success]--> closed
//! half_open --[trial failure]--> open
//! ```
//!
//! The open → half_open transition happens on the next observation of
//! state, not on a background timer. In half_open exactly one trial call
//! is granted; the transition and the trial permit are claimed under the
//! same lock, so racing workers cannot both probe the dependency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Dependency considered down, calls rejected.
    Open,
    /// Probing recovery with a single trial call.
    HalfOpen,
}

impl CircuitState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_half_open(&self) -> bool {
        matches!(self, Self::HalfOpen)
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a recovery probe is allowed.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Observable snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Mutable breaker state, guarded by one lock so that the half_open
/// transition and its trial permit cannot be observed separately.
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Monotonic instant of the transition to open.
    opened_at: Option<Instant>,
    /// Wall-clock timestamps for the status snapshot.
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    /// Set while the single half_open trial call is in flight.
    trial_in_flight: bool,
}

/// Circuit breaker guarding one external dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_at: None,
                last_success_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether a call may proceed.
    ///
    /// Closed: always true. Open: false until `recovery_timeout` has
    /// elapsed, at which point the breaker moves to half_open and this
    /// caller is granted the trial. Half_open: true only for the caller
    /// that wins the trial permit; everyone else is rejected until the
    /// trial resolves via `record_success` / `record_failure`.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.recovery_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "Circuit half-open, granting trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call against the dependency.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_success_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "Trial call succeeded, circuit closed");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
            }
            CircuitState::Open => {
                warn!(breaker = %self.name, "Success recorded while circuit open");
            }
        }
    }

    /// Record a failed call against the dependency.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Failure threshold reached, circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Trial call failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
            }
            CircuitState::Open => {
                // Refresh the open window so a flapping dependency keeps waiting.
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    /// Snapshot for observability. Observing an open breaker past its
    /// recovery timeout performs the lazy half_open transition, but does
    /// not claim the trial permit.
    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::Open && self.recovery_elapsed(&inner) {
            inner.state = CircuitState::HalfOpen;
            info!(breaker = %self.name, "Circuit half-open (observed via status)");
        }
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
        }
    }

    fn recovery_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout)
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Named breakers, one per dependency. Built at startup and passed to the
/// executor; stages whose handler declares no dependency bypass it.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker for a dependency name. Replaces any existing one.
    pub fn register(&mut self, name: impl Into<String>, config: BreakerConfig) {
        let name = name.into();
        self.breakers
            .insert(name.clone(), Arc::new(CircuitBreaker::new(name, config)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).cloned()
    }

    /// Status of every registered breaker, sorted by name.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut all: Vec<BreakerStatus> = self.breakers.values().map(|b| b.status()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
