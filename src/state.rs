//! Circuit breaker state machine implementation.
//!
//! [`Machine`] holds every counter and timestamp of a breaker and applies the
//! transition rules. It has no interior locking; [`CircuitBreaker`] keeps it
//! behind a single mutex so admission and bookkeeping are one critical
//! section.
//!
//! [`CircuitBreaker`]: crate::CircuitBreaker

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Circuit is closed and operations are allowed.
    Closed = 0,

    /// Circuit is open and operations are rejected.
    Open = 1,

    /// Circuit is allowing a limited number of operations to test recovery.
    HalfOpen = 2,
}

impl State {
    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: State,
    /// Consecutive failures observed while closed.
    pub consecutive_failures: u32,
    /// Consecutive probe successes observed while half-open.
    pub consecutive_successes: u32,
    /// Probes admitted and not yet finished while half-open.
    pub half_open_in_flight: u32,
    /// Time spent in the current state.
    pub time_in_state: Duration,
}

/// A state change, reported to logs and metrics once the lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub from: State,
    pub to: State,
    /// Set when entering Closed after having been Open.
    pub recovered_after: Option<Duration>,
}

/// Handed to an admitted call; ties its outcome to the state it was admitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Admission {
    generation: u64,
    probe: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admit {
    Allowed(Admission, Option<Transition>),
    Rejected(State),
}

#[derive(Debug)]
pub(crate) struct Machine {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    last_state_change: Instant,
    opened_at: Option<Instant>,
    // Bumped on every transition so late outcomes from an earlier state are ignored.
    generation: u64,
}

impl Machine {
    pub fn new(now: Instant) -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            last_state_change: now,
            opened_at: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            half_open_in_flight: self.half_open_in_flight,
            time_in_state: now.saturating_duration_since(self.last_state_change),
        }
    }

    /// Closed, or half-open with a probe slot free.
    pub fn is_healthy(&self, config: &BreakerConfig) -> bool {
        match self.state {
            State::Closed => true,
            State::Open => false,
            State::HalfOpen => self.half_open_in_flight < max_probes(config),
        }
    }

    /// Decides whether a call may proceed and reserves a probe slot if needed.
    pub fn admit(&mut self, config: &BreakerConfig, now: Instant) -> Admit {
        match self.state {
            State::Closed => Admit::Allowed(self.ticket(false), None),
            State::Open => {
                if now.saturating_duration_since(self.last_state_change) > config.reset_timeout {
                    let transition = self.transition(State::HalfOpen, now);
                    self.half_open_in_flight = 1;
                    Admit::Allowed(self.ticket(true), Some(transition))
                } else {
                    Admit::Rejected(State::Open)
                }
            }
            State::HalfOpen => {
                if self.half_open_in_flight < max_probes(config) {
                    self.half_open_in_flight += 1;
                    Admit::Allowed(self.ticket(true), None)
                } else {
                    Admit::Rejected(State::HalfOpen)
                }
            }
        }
    }

    /// Applies the outcome of an admitted call.
    pub fn record(
        &mut self,
        admission: Admission,
        success: bool,
        config: &BreakerConfig,
        now: Instant,
    ) -> Option<Transition> {
        if admission.generation != self.generation {
            return None;
        }
        if admission.probe {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }

        match (self.state, success) {
            (State::Closed, true) => {
                self.consecutive_failures = 0;
                None
            }
            (State::Closed, false) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= config.failure_threshold.max(1) {
                    Some(self.transition(State::Open, now))
                } else {
                    None
                }
            }
            (State::HalfOpen, true) => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= config.success_threshold.max(1) {
                    Some(self.transition(State::Closed, now))
                } else {
                    None
                }
            }
            (State::HalfOpen, false) => Some(self.transition(State::Open, now)),
            (State::Open, _) => None,
        }
    }

    /// Frees the probe slot of a call that never reported an outcome.
    pub fn release(&mut self, admission: Admission) {
        if admission.probe && admission.generation == self.generation {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    fn ticket(&self, probe: bool) -> Admission {
        Admission {
            generation: self.generation,
            probe,
        }
    }

    fn transition(&mut self, to: State, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.generation = self.generation.wrapping_add(1);

        let recovered_after = match to {
            State::Open => {
                self.opened_at = Some(now);
                None
            }
            State::Closed => self
                .opened_at
                .take()
                .map(|at| now.saturating_duration_since(at)),
            State::HalfOpen => None,
        };

        Transition {
            from,
            to,
            recovered_after,
        }
    }
}

/// The call that moves the breaker into half-open is always admitted.
fn max_probes(config: &BreakerConfig) -> u32 {
    config.half_open_max_calls.max(1)
}
