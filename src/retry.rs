//! Bounded retries with exponential backoff.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::{classify, ErrorClass};
use crate::config::{RetrierBuilder, RetryConfig};
use crate::error::{Cancelled, RetryError, RetryFailure};
use crate::metrics::{MetricSink, NullMetricSink, RetryOutcome};

/// Delay slept after failed attempt `attempt` (1-based).
///
/// `initial * factor^(attempt - 1)`, capped at `max`. Deterministic; no jitter.
pub fn backoff_delay(initial: Duration, max: Duration, factor: f64, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let nanos = initial.as_nanos() as f64 * factor.powi(exponent);

    if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
        max
    } else if nanos <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// Runs an operation up to a fixed number of times, sleeping between attempts.
///
/// A `Retrier` holds no per-call state; one instance can serve any number of
/// concurrent [`run`](Retrier::run) calls.
#[derive(Clone)]
pub struct Retrier {
    operation: Arc<str>,
    config: RetryConfig,
    retryable: SmallVec<[ErrorClass; 4]>,
    metric_sink: Arc<dyn MetricSink>,
}

impl Retrier {
    /// Creates a retrier that reports to no metric sink.
    pub fn new(operation: impl Into<String>, config: RetryConfig) -> Self {
        let retryable = config.retryable.iter().copied().collect();
        Self::from_parts(operation.into(), config, retryable, Arc::new(NullMetricSink))
    }

    pub(crate) fn from_parts(
        operation: String,
        config: RetryConfig,
        retryable: SmallVec<[ErrorClass; 4]>,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            operation: operation.into(),
            config,
            retryable,
            metric_sink,
        }
    }

    /// Creates a new builder.
    pub fn builder() -> RetrierBuilder {
        RetrierBuilder::new()
    }

    /// Configuration the retrier was built with.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay slept after failed attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.config.initial_delay,
            self.config.max_delay,
            self.config.backoff_factor,
            attempt,
        )
    }

    /// Whether an error of `class` may be retried.
    pub fn is_retryable(&self, class: ErrorClass) -> bool {
        if self.retryable.is_empty() {
            class.is_transient()
        } else {
            self.retryable.contains(&class)
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, attempts
    /// run out, or `token` is cancelled.
    ///
    /// Each attempt receives a child of `token`. Cancellation observed after a
    /// failed attempt or during a backoff delay returns
    /// [`RetryFailure::Cancelled`] rather than a [`RetryError`].
    pub async fn run<F, Fut, T, E>(
        &self,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 1;

        let (result, outcome) = loop {
            self.metric_sink.record_retry_attempt(&self.operation, attempt);
            let attempt_started = Instant::now();

            let error = match op(token.child_token()).await {
                Ok(value) => break (Ok(value), RetryOutcome::Success),
                Err(error) => error,
            };

            let class = classify(&error);
            warn!(
                operation = %self.operation,
                attempt,
                max_attempts,
                class = %class,
                elapsed = ?attempt_started.elapsed(),
                error = %error,
                "attempt failed"
            );
            self.metric_sink.record_retry_failure(&self.operation, class);

            if token.is_cancelled() {
                break (Err(Cancelled.into()), RetryOutcome::Cancelled);
            }
            if !self.is_retryable(class) {
                break (exhausted(attempt, error), RetryOutcome::NonRetryable);
            }
            if attempt >= max_attempts {
                break (exhausted(attempt, error), RetryOutcome::Exhausted);
            }

            let delay = self.delay(attempt);
            debug!(operation = %self.operation, attempt, ?delay, "backing off");
            self.metric_sink.record_retry_backoff(&self.operation, delay);

            let interrupted = tokio::select! {
                biased;
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if interrupted {
                break (Err(Cancelled.into()), RetryOutcome::Cancelled);
            }

            attempt += 1;
        };

        self.metric_sink
            .record_retry_outcome(&self.operation, outcome, attempt, started.elapsed());
        result
    }
}

fn exhausted<T, E>(attempt: u32, error: E) -> Result<T, RetryFailure<E>> {
    Err(RetryFailure::Exhausted(RetryError { attempt, error }))
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("operation", &self.operation)
            .field("config", &self.config)
            .finish()
    }
}
