//! Metric reporting for breakers, pools and retriers.
//!
//! Components report through [`MetricSink`]. Every method has an empty
//! default, so a sink only implements what it cares about. Sinks are called
//! outside of any state lock. A breaker delivers its transitions one at a
//! time, in the order they happened.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use crate::classify::ErrorClass;
use crate::pool::PoolStats;
use crate::state::State;

/// Terminal result of a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryOutcome {
    /// An attempt succeeded.
    Success,
    /// Every attempt failed with a retryable error.
    Exhausted,
    /// An attempt failed with an error that may not be retried.
    NonRetryable,
    /// Cancellation stopped the run.
    Cancelled,
}

impl RetryOutcome {
    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryOutcome::Success => "success",
            RetryOutcome::Exhausted => "exhausted",
            RetryOutcome::NonRetryable => "non_retryable",
            RetryOutcome::Cancelled => "cancelled",
        }
    }
}

impl Display for RetryOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for metrics sinks that can receive breaker, pool and retry events.
#[allow(unused_variables)]
pub trait MetricSink: Send + Sync + 'static {
    /// Records a breaker state transition.
    fn record_state_transition(&self, breaker: &str, from: State, to: State) {}

    /// Records a call that the breaker let through.
    fn record_call(&self, breaker: &str, success: bool, duration: Duration) {}

    /// Records a call rejected without running.
    fn record_rejection(&self, breaker: &str, state: State) {}

    /// Records the time from opening to closing again.
    fn record_recovery(&self, breaker: &str, duration: Duration) {}

    /// Records the pool's current occupancy.
    fn record_pool_stats(&self, pool: &str, stats: &PoolStats) {}

    /// Records how long a `get` took, whether or not it returned a connection.
    fn record_pool_get(&self, pool: &str, duration: Duration) {}

    /// Records a newly dialed connection.
    fn record_connection_created(&self, pool: &str) {}

    /// Records a connection leaving the pool; `reason` is `stale`, `retired` or `closed`.
    fn record_connection_removed(&self, pool: &str, reason: &str) {}

    /// Records a pool failure by its [`PoolError::label`](crate::PoolError::label).
    fn record_pool_error(&self, pool: &str, kind: &str) {}

    /// Records the start of an attempt.
    fn record_retry_attempt(&self, operation: &str, attempt: u32) {}

    /// Records a failed attempt and its class.
    fn record_retry_failure(&self, operation: &str, class: ErrorClass) {}

    /// Records a backoff delay about to be slept.
    fn record_retry_backoff(&self, operation: &str, delay: Duration) {}

    /// Records how a retried operation ended.
    fn record_retry_outcome(
        &self,
        operation: &str,
        outcome: RetryOutcome,
        attempts: u32,
        duration: Duration,
    ) {
    }
}

/// A null metrics sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {}

#[cfg(feature = "prometheus")]
pub use self::prometheus::PrometheusSink;

#[cfg(feature = "prometheus")]
mod prometheus {
    use std::time::Duration;

    use prometheus_client::encoding::EncodeLabelSet;
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::metrics::family::Family;
    use prometheus_client::metrics::gauge::Gauge;
    use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
    use prometheus_client::registry::Registry;

    use super::{MetricSink, RetryOutcome};
    use crate::classify::ErrorClass;
    use crate::pool::PoolStats;
    use crate::state::State;

    type HistogramFamily<L> = Family<L, Histogram, fn() -> Histogram>;

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct BreakerLabels {
        name: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct RequestLabels {
        name: String,
        status: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct TransitionLabels {
        name: String,
        from: String,
        to: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct PoolLabels {
        pool: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct PoolErrorLabels {
        pool: String,
        kind: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct RemovalLabels {
        pool: String,
        reason: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct OperationLabels {
        operation: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct FailureLabels {
        operation: String,
        class: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct OutcomeLabels {
        operation: String,
        outcome: String,
    }

    fn recovery_histogram() -> Histogram {
        Histogram::new(
            [1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0].into_iter(),
        )
    }

    fn get_duration_histogram() -> Histogram {
        Histogram::new(exponential_buckets(0.001, 2.0, 10))
    }

    fn retry_histogram() -> Histogram {
        Histogram::new(exponential_buckets(0.01, 2.0, 10))
    }

    /// [`MetricSink`] backed by `prometheus-client`.
    ///
    /// Cloning is cheap; clones share the same metric families.
    #[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
    #[derive(Clone)]
    pub struct PrometheusSink {
        breaker_state: Family<BreakerLabels, Gauge>,
        breaker_requests: Family<RequestLabels, Counter>,
        breaker_transitions: Family<TransitionLabels, Counter>,
        breaker_recovery: HistogramFamily<BreakerLabels>,

        pool_total: Family<PoolLabels, Gauge>,
        pool_active: Family<PoolLabels, Gauge>,
        pool_waiting: Family<PoolLabels, Gauge>,
        pool_get_duration: HistogramFamily<PoolLabels>,
        pool_errors: Family<PoolErrorLabels, Counter>,
        pool_created: Family<PoolLabels, Counter>,
        pool_removed: Family<RemovalLabels, Counter>,

        retry_attempts: Family<OperationLabels, Counter>,
        retry_failures: Family<FailureLabels, Counter>,
        retry_outcomes: Family<OutcomeLabels, Counter>,
        retry_backoff: HistogramFamily<OperationLabels>,
        retry_duration: HistogramFamily<OutcomeLabels>,
    }

    impl PrometheusSink {
        /// Creates the metric families and registers them.
        pub fn new(registry: &mut Registry) -> Self {
            let sink = Self {
                breaker_state: Family::default(),
                breaker_requests: Family::default(),
                breaker_transitions: Family::default(),
                breaker_recovery: Family::new_with_constructor(recovery_histogram as fn() -> Histogram),
                pool_total: Family::default(),
                pool_active: Family::default(),
                pool_waiting: Family::default(),
                pool_get_duration: Family::new_with_constructor(
                    get_duration_histogram as fn() -> Histogram,
                ),
                pool_errors: Family::default(),
                pool_created: Family::default(),
                pool_removed: Family::default(),
                retry_attempts: Family::default(),
                retry_failures: Family::default(),
                retry_outcomes: Family::default(),
                retry_backoff: Family::new_with_constructor(retry_histogram as fn() -> Histogram),
                retry_duration: Family::new_with_constructor(retry_histogram as fn() -> Histogram),
            };

            registry.register(
                "circuit_breaker_state",
                "Current state of the circuit breaker (0=closed, 1=open, 2=half_open)",
                sink.breaker_state.clone(),
            );
            registry.register(
                "circuit_breaker_requests",
                "Calls seen by the circuit breaker by status",
                sink.breaker_requests.clone(),
            );
            registry.register(
                "circuit_breaker_state_transitions",
                "State transitions of the circuit breaker",
                sink.breaker_transitions.clone(),
            );
            registry.register(
                "circuit_breaker_recovery_duration_seconds",
                "Time from opening to closing again",
                sink.breaker_recovery.clone(),
            );
            registry.register(
                "connection_pool_total_connections",
                "Open connections, in use or free",
                sink.pool_total.clone(),
            );
            registry.register(
                "connection_pool_active_connections",
                "Connections currently checked out",
                sink.pool_active.clone(),
            );
            registry.register(
                "connection_pool_waiting_requests",
                "Callers waiting for a free connection",
                sink.pool_waiting.clone(),
            );
            registry.register(
                "connection_pool_get_duration_seconds",
                "Time taken to obtain a connection",
                sink.pool_get_duration.clone(),
            );
            registry.register(
                "connection_pool_errors",
                "Pool failures by type",
                sink.pool_errors.clone(),
            );
            registry.register(
                "connection_pool_created_connections",
                "Connections dialed",
                sink.pool_created.clone(),
            );
            registry.register(
                "connection_pool_removed_connections",
                "Connections removed by reason",
                sink.pool_removed.clone(),
            );
            registry.register(
                "retry_attempts",
                "Attempts made by retried operations",
                sink.retry_attempts.clone(),
            );
            registry.register(
                "retry_failures",
                "Failed attempts by error class",
                sink.retry_failures.clone(),
            );
            registry.register(
                "retry_outcomes",
                "Retried operations by final outcome",
                sink.retry_outcomes.clone(),
            );
            registry.register(
                "retry_backoff_seconds",
                "Delays slept between attempts",
                sink.retry_backoff.clone(),
            );
            registry.register(
                "retry_duration_seconds",
                "Total time spent in retried operations",
                sink.retry_duration.clone(),
            );

            sink
        }
    }

    fn breaker(name: &str) -> BreakerLabels {
        BreakerLabels {
            name: name.to_string(),
        }
    }

    fn pool(name: &str) -> PoolLabels {
        PoolLabels {
            pool: name.to_string(),
        }
    }

    fn operation(name: &str) -> OperationLabels {
        OperationLabels {
            operation: name.to_string(),
        }
    }

    fn gauge_value(count: usize) -> i64 {
        i64::try_from(count).unwrap_or(i64::MAX)
    }

    impl MetricSink for PrometheusSink {
        fn record_state_transition(&self, name: &str, from: State, to: State) {
            self.breaker_state.get_or_create(&breaker(name)).set(to as i64);
            self.breaker_transitions
                .get_or_create(&TransitionLabels {
                    name: name.to_string(),
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                })
                .inc();
        }

        fn record_call(&self, name: &str, success: bool, _duration: Duration) {
            let status = if success { "success" } else { "failure" };
            self.breaker_requests
                .get_or_create(&RequestLabels {
                    name: name.to_string(),
                    status: status.to_string(),
                })
                .inc();
        }

        fn record_rejection(&self, name: &str, _state: State) {
            self.breaker_requests
                .get_or_create(&RequestLabels {
                    name: name.to_string(),
                    status: "rejected".to_string(),
                })
                .inc();
        }

        fn record_recovery(&self, name: &str, duration: Duration) {
            self.breaker_recovery
                .get_or_create(&breaker(name))
                .observe(duration.as_secs_f64());
        }

        fn record_pool_stats(&self, name: &str, stats: &PoolStats) {
            let labels = pool(name);
            self.pool_total.get_or_create(&labels).set(gauge_value(stats.total));
            self.pool_active.get_or_create(&labels).set(gauge_value(stats.active));
            self.pool_waiting.get_or_create(&labels).set(gauge_value(stats.waiting));
        }

        fn record_pool_get(&self, name: &str, duration: Duration) {
            self.pool_get_duration
                .get_or_create(&pool(name))
                .observe(duration.as_secs_f64());
        }

        fn record_connection_created(&self, name: &str) {
            self.pool_created.get_or_create(&pool(name)).inc();
        }

        fn record_connection_removed(&self, name: &str, reason: &str) {
            self.pool_removed
                .get_or_create(&RemovalLabels {
                    pool: name.to_string(),
                    reason: reason.to_string(),
                })
                .inc();
        }

        fn record_pool_error(&self, name: &str, kind: &str) {
            self.pool_errors
                .get_or_create(&PoolErrorLabels {
                    pool: name.to_string(),
                    kind: kind.to_string(),
                })
                .inc();
        }

        fn record_retry_attempt(&self, name: &str, _attempt: u32) {
            self.retry_attempts.get_or_create(&operation(name)).inc();
        }

        fn record_retry_failure(&self, name: &str, class: ErrorClass) {
            self.retry_failures
                .get_or_create(&FailureLabels {
                    operation: name.to_string(),
                    class: class.as_str().to_string(),
                })
                .inc();
        }

        fn record_retry_backoff(&self, name: &str, delay: Duration) {
            self.retry_backoff
                .get_or_create(&operation(name))
                .observe(delay.as_secs_f64());
        }

        fn record_retry_outcome(
            &self,
            name: &str,
            outcome: RetryOutcome,
            _attempts: u32,
            duration: Duration,
        ) {
            let labels = OutcomeLabels {
                operation: name.to_string(),
                outcome: outcome.as_str().to_string(),
            };
            self.retry_outcomes.get_or_create(&labels).inc();
            self.retry_duration
                .get_or_create(&labels)
                .observe(duration.as_secs_f64());
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use prometheus_client::encoding::text::encode;

        #[test]
        fn test_exports_named_metrics() {
            let mut registry = Registry::default();
            let sink = PrometheusSink::new(&mut registry);

            sink.record_state_transition("gotenberg", State::Closed, State::Open);
            sink.record_rejection("gotenberg", State::Open);
            sink.record_pool_stats(
                "gotenberg",
                &PoolStats {
                    total: 3,
                    active: 1,
                    idle: 2,
                    waiting: 0,
                },
            );
            sink.record_pool_error("gotenberg", "exhausted");
            sink.record_retry_outcome("convert", RetryOutcome::Success, 1, Duration::from_millis(5));

            let mut out = String::new();
            encode(&mut out, &registry).expect("encode registry");

            assert!(out.contains("circuit_breaker_state{name=\"gotenberg\"} 1"));
            assert!(out.contains("circuit_breaker_requests_total{name=\"gotenberg\",status=\"rejected\"} 1"));
            assert!(out.contains("connection_pool_total_connections{pool=\"gotenberg\"} 3"));
            assert!(out.contains("connection_pool_errors_total{pool=\"gotenberg\",kind=\"exhausted\"} 1"));
            assert!(out.contains("retry_outcomes_total{operation=\"convert\",outcome=\"success\"} 1"));
        }
    }
}
