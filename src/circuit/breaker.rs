//! Single-dependency circuit breaker state machine
//!
//! Pure and clock-free: callers pass `now_ms` (wall-clock epoch millis) in,
//! and every mutation reports the edge it took, if any. Persistence,
//! scheduling and observers live in the registry.
//!
//! ```text
//! CLOSED ──(failure_threshold failures)──▶ OPEN ──(recovery timeout)──▶ HALF_OPEN
//!    ▲                                      ▲                              │
//!    │                                      └────────(any failure)─────────┤
//!    └──────────────(half_open_success_threshold successes)────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health of one guarded dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast until the recovery timeout elapses
    Open,
    /// Trial calls are admitted one at a time
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed per-dependency tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Name the breaker is registered and persisted under
    pub service_id: String,
    /// Consecutive failures in CLOSED that open the circuit
    pub failure_threshold: u32,
    /// Time spent OPEN before a trial is allowed
    pub recovery_timeout_ms: u64,
    /// Consecutive HALF_OPEN successes that close the circuit
    pub half_open_success_threshold: u32,
}

impl CircuitBreakerConfig {
    /// Config with default thresholds (5 failures, 30s recovery, 1 success)
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_success_threshold: 1,
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Everything about a breaker that must survive a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Epoch millis at which OPEN may move to HALF_OPEN
    pub next_recovery_at_ms: Option<i64>,
}

/// An FSM edge taken by a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Result of asking whether a call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Set when admission itself moved an overdue OPEN breaker to HALF_OPEN
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_recovery_at_ms: Option<i64>,
    /// When the outstanding HALF_OPEN trial was admitted. Not persisted: a
    /// trial in flight at crash time never reports back.
    trial_started_at_ms: Option<i64>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_recovery_at_ms: None,
            trial_started_at_ms: None,
        }
    }

    /// Rebuild a breaker from persisted state
    pub fn restore(config: CircuitBreakerConfig, snapshot: BreakerSnapshot) -> Self {
        let next_recovery_at_ms = match snapshot.state {
            CircuitState::Open => snapshot.next_recovery_at_ms,
            _ => None,
        };
        Self {
            config,
            state: snapshot.state,
            failure_count: snapshot.failure_count,
            success_count: snapshot.success_count,
            next_recovery_at_ms,
            trial_started_at_ms: None,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            next_recovery_at_ms: self.next_recovery_at_ms,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    pub fn next_recovery_at_ms(&self) -> Option<i64> {
        self.next_recovery_at_ms
    }

    /// Time left in the OPEN window; `Some(ZERO)` if overdue, `None` unless OPEN
    pub fn recovery_remaining(&self, now_ms: i64) -> Option<Duration> {
        match (self.state, self.next_recovery_at_ms) {
            (CircuitState::Open, Some(at)) => {
                Some(Duration::from_millis(at.saturating_sub(now_ms).max(0) as u64))
            }
            (CircuitState::Open, None) => Some(Duration::ZERO),
            _ => None,
        }
    }

    /// Decide whether a call may be attempted now
    pub fn try_acquire(&mut self, now_ms: i64) -> Admission {
        match self.state {
            CircuitState::Closed => Admission {
                allowed: true,
                transition: None,
            },
            CircuitState::Open => {
                if self.recovery_remaining(now_ms) == Some(Duration::ZERO) {
                    let transition = self.on_recovery_due();
                    self.trial_started_at_ms = Some(now_ms);
                    Admission {
                        allowed: true,
                        transition,
                    }
                } else {
                    Admission {
                        allowed: false,
                        transition: None,
                    }
                }
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back frees its slot after one
                // recovery timeout
                let allowed = match self.trial_started_at_ms {
                    None => true,
                    Some(at) => {
                        now_ms.saturating_sub(at) >= self.config.recovery_timeout_ms as i64
                    }
                };
                if allowed {
                    self.trial_started_at_ms = Some(now_ms);
                }
                Admission {
                    allowed,
                    transition: None,
                }
            }
        }
    }

    pub fn on_success(&mut self) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.trial_started_at_ms = None;
                self.success_count += 1;
                if self.success_count >= self.config.half_open_success_threshold {
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.next_recovery_at_ms = None;
                    Some(self.move_to(CircuitState::Closed))
                } else {
                    None
                }
            }
            // Late result from a call admitted before the circuit opened
            CircuitState::Open => None,
        }
    }

    pub fn on_failure(&mut self, now_ms: i64) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    Some(self.open(now_ms))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => Some(self.open(now_ms)),
            CircuitState::Open => None,
        }
    }

    /// The recovery deadline passed: OPEN moves to HALF_OPEN, anything else is stale
    pub fn on_recovery_due(&mut self) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        self.success_count = 0;
        self.trial_started_at_ms = None;
        self.next_recovery_at_ms = None;
        Some(self.move_to(CircuitState::HalfOpen))
    }

    fn open(&mut self, now_ms: i64) -> Transition {
        self.success_count = 0;
        self.trial_started_at_ms = None;
        self.next_recovery_at_ms = Some(now_ms + self.config.recovery_timeout_ms as i64);
        self.move_to(CircuitState::Open)
    }

    fn move_to(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        Transition { from, to }
    }
}
