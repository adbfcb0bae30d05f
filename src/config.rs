//! Configuration and builders for breakers, retriers and pools.
//!
//! The config structs deserialize with `serde` so they can be loaded through
//! [`Settings`](crate::Settings); durations are given in milliseconds under a
//! `_ms` key. Every field has a default, so a partial source is fine.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use smallvec::SmallVec;

use crate::breaker::CircuitBreaker;
use crate::classify::ErrorClass;
use crate::metrics::{MetricSink, NullMetricSink};
use crate::pool::{ConnectionPool, Dialer, Resource};
use crate::retry::Retrier;

fn duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Tunables of a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed that trip the breaker. Zero trips on the first failure.
    pub failure_threshold: u32,

    /// How long the breaker stays Open before the next call is let through as a probe.
    #[serde(rename = "reset_timeout_ms", deserialize_with = "duration_ms")]
    pub reset_timeout: Duration,

    /// Concurrent probes admitted while HalfOpen. Zero behaves as one.
    pub half_open_max_calls: u32,

    /// Consecutive probe successes that close the breaker. Zero closes on the first success.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(5),
            half_open_max_calls: 5,
            success_threshold: 3,
        }
    }
}

/// Tunables of a [`Retrier`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first. Zero behaves as one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(rename = "initial_delay_ms", deserialize_with = "duration_ms")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms", deserialize_with = "duration_ms")]
    pub max_delay: Duration,

    /// Multiplier applied per attempt.
    pub backoff_factor: f64,

    /// Error classes that may be retried. Empty means: anything but validation errors.
    pub retryable: Vec<ErrorClass>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            retryable: Vec::new(),
        }
    }
}

/// Tunables of a [`ConnectionPool`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept open when idle; the pool is pre-warmed to this size.
    pub min_conns: usize,

    /// Hard cap on open connections, in use or not.
    pub max_conns: usize,

    /// A free connection unused for longer than this is evicted.
    #[serde(rename = "max_idle_time_ms", deserialize_with = "duration_ms")]
    pub max_idle_time: Duration,

    /// A connection older than this is evicted or retired on return.
    #[serde(rename = "max_lifetime_ms", deserialize_with = "duration_ms")]
    pub max_lifetime: Duration,

    /// Bound on a single dial.
    #[serde(rename = "dial_timeout_ms", deserialize_with = "duration_ms")]
    pub dial_timeout: Duration,

    /// How long `get` waits for a free connection once the pool is full.
    #[serde(rename = "idle_timeout_ms", deserialize_with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Period of the background eviction and top-up task.
    #[serde(rename = "cleanup_interval_ms", deserialize_with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_conns: 5,
            max_conns: 50,
            max_idle_time: Duration::from_secs(5 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
            dial_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Builder for creating circuit breakers with custom configurations.
pub struct BreakerBuilder {
    name: String,
    config: BreakerConfig,
    metric_sink: Arc<dyn MetricSink>,
}

impl Default for BreakerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            name: "default".to_string(),
            config: BreakerConfig::default(),
            metric_sink: Arc::new(NullMetricSink),
        }
    }

    /// Sets the name used in logs and metric labels.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of consecutive failures required to trip the circuit.
    pub fn failure_threshold(mut self, count: u32) -> Self {
        self.config.failure_threshold = count;
        self
    }

    /// Sets how long the circuit stays open before letting a probe through.
    pub fn reset_timeout(mut self, duration: Duration) -> Self {
        self.config.reset_timeout = duration;
        self
    }

    /// Sets the number of concurrent probes allowed in half-open state.
    pub fn half_open_max_calls(mut self, count: u32) -> Self {
        self.config.half_open_max_calls = count;
        self
    }

    /// Sets the number of consecutive successes required to close the circuit.
    pub fn success_threshold(mut self, count: u32) -> Self {
        self.config.success_threshold = count;
        self
    }

    /// Sets a metric sink for the circuit breaker.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Shares an existing metric sink.
    pub fn shared_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Builds a new circuit breaker with the configured settings.
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::with_sink(self.name, self.config, self.metric_sink)
    }
}

/// Builder for [`Retrier`].
pub struct RetrierBuilder {
    operation: String,
    config: RetryConfig,
    metric_sink: Arc<dyn MetricSink>,
}

impl Default for RetrierBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetrierBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            operation: "default".to_string(),
            config: RetryConfig::default(),
            metric_sink: Arc::new(NullMetricSink),
        }
    }

    /// Sets the operation label used in logs and metrics.
    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the total number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Sets the delay after the first failure.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    /// Sets the cap on a single delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    /// Adds an error class to the allow-list. Once any class is added,
    /// only listed classes are retried.
    pub fn retry_on(mut self, class: ErrorClass) -> Self {
        if !self.config.retryable.contains(&class) {
            self.config.retryable.push(class);
        }
        self
    }

    /// Sets a metric sink for the retrier.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Shares an existing metric sink.
    pub fn shared_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Builds the retrier.
    pub fn build(self) -> Retrier {
        let retryable: SmallVec<[ErrorClass; 4]> = self.config.retryable.iter().copied().collect();
        Retrier::from_parts(self.operation, self.config, retryable, self.metric_sink)
    }
}

/// Builder for [`ConnectionPool`].
pub struct PoolBuilder<R: Resource> {
    name: String,
    config: PoolConfig,
    dialer: Box<dyn Dialer<R>>,
    metric_sink: Arc<dyn MetricSink>,
}

impl<R: Resource> PoolBuilder<R> {
    /// Creates a builder around the function that opens new connections.
    pub fn new<D>(dialer: D) -> Self
    where
        D: Dialer<R>,
    {
        Self {
            name: "default".to_string(),
            config: PoolConfig::default(),
            dialer: Box::new(dialer),
            metric_sink: Arc::new(NullMetricSink),
        }
    }

    /// Sets the name used in logs and metric labels.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of connections kept warm.
    pub fn min_conns(mut self, count: usize) -> Self {
        self.config.min_conns = count;
        self
    }

    /// Sets the cap on open connections.
    pub fn max_conns(mut self, count: usize) -> Self {
        self.config.max_conns = count;
        self
    }

    /// Sets how long a free connection may sit unused.
    pub fn max_idle_time(mut self, duration: Duration) -> Self {
        self.config.max_idle_time = duration;
        self
    }

    /// Sets the maximum age of a connection.
    pub fn max_lifetime(mut self, duration: Duration) -> Self {
        self.config.max_lifetime = duration;
        self
    }

    /// Sets the bound on a single dial.
    pub fn dial_timeout(mut self, duration: Duration) -> Self {
        self.config.dial_timeout = duration;
        self
    }

    /// Sets how long `get` waits for a free connection.
    pub fn idle_timeout(mut self, duration: Duration) -> Self {
        self.config.idle_timeout = duration;
        self
    }

    /// Sets the period of the background maintenance task.
    pub fn cleanup_interval(mut self, duration: Duration) -> Self {
        self.config.cleanup_interval = duration;
        self
    }

    /// Sets a metric sink for the pool.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Shares an existing metric sink.
    pub fn shared_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Builds the pool, pre-warms it to `min_conns` and starts its maintenance task.
    ///
    /// Pre-warm failures are logged, not returned. Must be called within a
    /// tokio runtime.
    pub async fn build(self) -> ConnectionPool<R> {
        ConnectionPool::from_parts(self.name, self.config, self.dialer, self.metric_sink).await
    }
}
