//! Error types for the breaker, pool, retrier and the guarded call path.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use thiserror::Error;

/// Boxed error reported by dialers and resource close functions.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type for circuit breaker operations.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// The cancellation signal fired before the work could finish.
///
/// Every layer hands this back as-is; it is never folded into a
/// [`RetryError`] or a pool failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Error type for circuit breaker operations.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open, or half-open with every probe slot taken.
    /// The operation was not invoked.
    #[error("circuit breaker is open")]
    Open,

    /// The underlying operation failed. Its error is passed through unchanged.
    #[error("{0}")]
    Operation(#[source] E),
}

impl<E> BreakerError<E> {
    /// Returns true if the call was rejected without running.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }

    /// Returns the operation's own error, if the operation ran.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Open => None,
            BreakerError::Operation(e) => Some(e),
        }
    }
}

/// Errors returned by the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was closed before or while the request was made.
    #[error("connection pool is closed")]
    Closed,

    /// No connection became free within the pool's idle timeout.
    #[error("connection pool exhausted")]
    Exhausted,

    /// The caller's cancellation signal fired while waiting.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// The dialer failed to create a connection.
    #[error("failed to dial connection: {0}")]
    Dial(#[source] BoxError),

    /// The dialer did not finish within the configured dial timeout.
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// Closing one or more connections failed while closing the pool.
    #[error("failed to close connection: {0}")]
    Close(#[source] BoxError),
}

impl PoolError {
    /// Short label used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            PoolError::Closed => "closed",
            PoolError::Exhausted => "exhausted",
            PoolError::Cancelled(_) => "cancelled",
            PoolError::Dial(_) => "dial",
            PoolError::DialTimeout(_) => "dial_timeout",
            PoolError::Close(_) => "close",
        }
    }
}

/// Terminal failure report of a retried operation.
///
/// `attempt` is the attempt at which retrying stopped: the first
/// non-retryable failure, or the configured maximum.
#[derive(Debug, Error)]
#[error("retry attempt {attempt} failed: {error}")]
pub struct RetryError<E> {
    /// Attempt number (1-based) of the last failure.
    pub attempt: u32,

    /// Error returned by that attempt.
    #[source]
    pub error: E,
}

/// Why [`Retrier::run`](crate::Retrier::run) gave up.
#[derive(Debug, Error)]
pub enum RetryFailure<E> {
    /// Cancellation fired after a failed attempt or during a backoff delay.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// Attempts were exhausted or the error was not retryable.
    #[error(transparent)]
    Exhausted(RetryError<E>),
}

impl<E> RetryFailure<E> {
    /// Returns true if cancellation ended the run.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryFailure::Cancelled(_))
    }

    /// Returns the retry report, if attempts ran out or the error was not retryable.
    pub fn retry_error(&self) -> Option<&RetryError<E>> {
        match self {
            RetryFailure::Cancelled(_) => None,
            RetryFailure::Exhausted(e) => Some(e),
        }
    }
}

/// Failure of a guarded call, as seen by the top-level caller.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// Retries stopped while the circuit breaker was rejecting calls.
    #[error("circuit breaker is open after {attempts} attempt(s)")]
    CircuitOpen {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The connection pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// No pooled connection became free in time.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// A new connection could not be established.
    #[error("failed to acquire connection: {0}")]
    Connect(#[source] PoolError),

    /// The operation kept failing; carries the last operation error.
    #[error(transparent)]
    Retry(RetryError<E>),

    /// The caller's cancellation signal fired.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Coarse category of a [`GuardError`], stable enough for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`GuardError::CircuitOpen`].
    CircuitOpen,
    /// See [`GuardError::PoolClosed`].
    PoolClosed,
    /// See [`GuardError::PoolExhausted`].
    PoolExhausted,
    /// See [`GuardError::Connect`].
    Connect,
    /// See [`GuardError::Retry`].
    RetryExhausted,
    /// See [`GuardError::Cancelled`].
    Cancelled,
}

impl ErrorKind {
    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::PoolClosed => "pool_closed",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Connect => "connect",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<E> GuardError<E> {
    /// Category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            GuardError::PoolClosed => ErrorKind::PoolClosed,
            GuardError::PoolExhausted => ErrorKind::PoolExhausted,
            GuardError::Connect(_) => ErrorKind::Connect,
            GuardError::Retry(_) => ErrorKind::RetryExhausted,
            GuardError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

impl<E> From<PoolError> for GuardError<E> {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Closed => GuardError::PoolClosed,
            PoolError::Exhausted => GuardError::PoolExhausted,
            PoolError::Cancelled(c) => GuardError::Cancelled(c),
            other => GuardError::Connect(other),
        }
    }
}

impl<E> From<RetryFailure<BreakerError<E>>> for GuardError<E> {
    fn from(failure: RetryFailure<BreakerError<E>>) -> Self {
        match failure {
            RetryFailure::Cancelled(c) => GuardError::Cancelled(c),
            RetryFailure::Exhausted(RetryError {
                attempt,
                error: BreakerError::Open,
            }) => GuardError::CircuitOpen { attempts: attempt },
            RetryFailure::Exhausted(RetryError {
                attempt,
                error: BreakerError::Operation(error),
            }) => GuardError::Retry(RetryError { attempt, error }),
        }
    }
}
