//! Core circuit breaker implementation.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{BreakerBuilder, BreakerConfig};
use crate::error::{BreakerError, BreakerResult};
use crate::metrics::{MetricSink, NullMetricSink};
use crate::state::{Admission, Admit, BreakerSnapshot, Machine, State, Transition};

/// Inner state of the circuit breaker, shared between clones.
struct BreakerInner {
    name: String,
    config: BreakerConfig,
    machine: Mutex<Machine>,
    // Transitions waiting to be reported, in the order the machine made them.
    pending: Mutex<VecDeque<Transition>>,
    // Held while reporting so the sink sees transitions one at a time, in order.
    reporting: Mutex<()>,
    metric_sink: Arc<dyn MetricSink>,
}

/// A circuit breaker that can wrap function calls to prevent cascading failures.
///
/// One breaker guards one dependency. Clones share state, so a breaker can be
/// handed to every caller of that dependency.
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker that reports to no metric sink.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_sink(name, config, Arc::new(NullMetricSink))
    }

    /// Creates a breaker that reports to `metric_sink`.
    pub fn with_sink(
        name: impl Into<String>,
        config: BreakerConfig,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Self {
        let inner = BreakerInner {
            name: name.into(),
            config,
            machine: Mutex::new(Machine::new(Instant::now())),
            pending: Mutex::new(VecDeque::new()),
            reporting: Mutex::new(()),
            metric_sink,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a new builder for customizing a circuit breaker.
    pub fn builder() -> BreakerBuilder {
        BreakerBuilder::new()
    }

    /// Name used in logs and metric labels.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration the breaker was built with.
    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Gets the current state of the circuit breaker.
    ///
    /// An Open breaker whose reset timeout has passed still reports Open until
    /// the next call moves it to HalfOpen.
    pub fn state(&self) -> State {
        self.inner.machine.lock().state()
    }

    /// True when Closed, or HalfOpen with a probe slot free.
    pub fn is_healthy(&self) -> bool {
        self.inner.machine.lock().is_healthy(&self.inner.config)
    }

    /// Current counters.
    pub fn snapshot(&self) -> BreakerSnapshot {
        self.inner.machine.lock().snapshot(Instant::now())
    }

    /// Executes a function wrapped by the circuit breaker.
    pub fn call<F, T, E>(&self, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let permit = self.admit()?;

        let start = Instant::now();
        let result = f();
        let success = result.is_ok();
        self.inner
            .metric_sink
            .record_call(&self.inner.name, success, start.elapsed());
        permit.finish(success);

        result.map_err(BreakerError::Operation)
    }

    /// Executes an async operation wrapped by the circuit breaker.
    ///
    /// The operation receives a child of `token`. A rejected call returns
    /// [`BreakerError::Open`] without invoking `f`. If the returned future is
    /// dropped before completing, its probe slot is released and no outcome is
    /// recorded.
    pub async fn execute<F, Fut, T, E>(&self, token: &CancellationToken, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.admit()?;

        let start = Instant::now();
        let result = f(token.child_token()).await;
        let success = result.is_ok();
        self.inner
            .metric_sink
            .record_call(&self.inner.name, success, start.elapsed());
        permit.finish(success);

        result.map_err(BreakerError::Operation)
    }

    fn admit<E>(&self) -> Result<Permit<'_>, BreakerError<E>> {
        let admit = {
            let mut machine = self.inner.machine.lock();
            let admit = machine.admit(&self.inner.config, Instant::now());
            if let Admit::Allowed(_, Some(transition)) = admit {
                self.inner.enqueue(transition);
            }
            admit
        };

        match admit {
            Admit::Allowed(admission, transition) => {
                if transition.is_some() {
                    self.inner.announce();
                }
                Ok(Permit {
                    inner: &*self.inner,
                    admission: Some(admission),
                })
            }
            Admit::Rejected(state) => {
                debug!(breaker = %self.inner.name, %state, "call rejected");
                self.inner.metric_sink.record_rejection(&self.inner.name, state);
                Err(BreakerError::Open)
            }
        }
    }
}

impl BreakerInner {
    // Called with the machine lock held.
    fn enqueue(&self, transition: Transition) {
        self.pending.lock().push_back(transition);
    }

    /// Reports queued transitions. Called with the machine lock released.
    fn announce(&self) {
        let _reporting = self.reporting.lock();
        loop {
            let Some(transition) = self.pending.lock().pop_front() else {
                break;
            };
            info!(
                breaker = %self.name,
                from = %transition.from,
                to = %transition.to,
                "circuit breaker state changed"
            );
            self.metric_sink
                .record_state_transition(&self.name, transition.from, transition.to);

            if let Some(elapsed) = transition.recovered_after {
                info!(breaker = %self.name, ?elapsed, "circuit breaker recovered");
                self.metric_sink.record_recovery(&self.name, elapsed);
            }
        }
    }
}

/// An admitted call. Dropping it without `finish` frees any probe slot.
struct Permit<'a> {
    inner: &'a BreakerInner,
    admission: Option<Admission>,
}

impl Permit<'_> {
    fn finish(mut self, success: bool) {
        let Some(admission) = self.admission.take() else {
            return;
        };
        let transitioned = {
            let mut machine = self.inner.machine.lock();
            match machine.record(admission, success, &self.inner.config, Instant::now()) {
                Some(transition) => {
                    self.inner.enqueue(transition);
                    true
                }
                None => false,
            }
        };
        if transitioned {
            self.inner.announce();
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.inner.machine.lock().release(admission);
        }
    }
}

// Allow cloning of circuit breakers - cheap because inner state is Arc'd
impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}
