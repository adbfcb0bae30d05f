//! # breakwater
//!
//! Resilience primitives for calling an unreliable backend over pooled
//! connections: a circuit breaker, a bounded connection pool, a retrier with
//! exponential backoff, and [`GuardedBackend`], which composes the three.
//!
//! ## What is a Circuit Breaker?
//!
//! The Circuit Breaker pattern helps prevent cascading failures in distributed systems
//! by temporarily disabling operations that are likely to fail. It operates in three
//! states:
//!
//! - **Closed**: Normal operation. Calls pass through; consecutive failures are counted.
//! - **Open**: Calls are immediately rejected without attempting to reach the resource.
//! - **Half-Open**: After the reset timeout, a bounded number of probe calls are permitted
//!   to check whether the resource has recovered. One failure reopens the circuit.
//!
//! ## Basic Usage
//!
//! ```rust
//! use breakwater::{BreakerError, CircuitBreaker};
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("service error: {0}")]
//! struct ServiceError(String);
//!
//! let breaker = CircuitBreaker::builder()
//!     .name("converter")
//!     .failure_threshold(5)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build();
//!
//! match breaker.call(|| Ok::<_, ServiceError>("converted")) {
//!     Ok(result) => println!("call succeeded: {result}"),
//!     Err(BreakerError::Open) => println!("circuit is open, call was prevented"),
//!     Err(BreakerError::Operation(err)) => println!("call failed: {err}"),
//! }
//! ```
//!
//! ## Guarded calls
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use breakwater::{
//!     BoxError, CircuitBreaker, ConnectionPool, GuardedBackend, PoolConfig, Resource, Retrier,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct Session;
//! impl Resource for Session {}
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ConnectionPool::new("converter", PoolConfig::default(), |_token: CancellationToken| async {
//!     Ok::<_, BoxError>(Session)
//! })
//! .await;
//!
//! let backend = GuardedBackend::new(
//!     Arc::new(pool),
//!     CircuitBreaker::builder().name("converter").build(),
//!     Retrier::builder().operation("convert").build(),
//! );
//!
//! let token = CancellationToken::new();
//! let pdf = backend
//!     .call(&token, |_session, _token| async { Ok::<_, std::io::Error>(vec![0u8; 4]) })
//!     .await?;
//! # let _ = pdf;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `prometheus` - [`PrometheusSink`] metrics on `prometheus-client`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod breaker;
mod classify;
mod config;
mod error;
mod guard;
mod metrics;
mod pool;
pub mod prelude;
mod retry;
mod settings;
mod state;

// Re-exports
pub use breaker::CircuitBreaker;
pub use classify::{classify, ErrorClass};
pub use self::config::{
    BreakerBuilder, BreakerConfig, PoolBuilder, PoolConfig, RetrierBuilder, RetryConfig,
};
pub use error::{
    BoxError, BreakerError, BreakerResult, Cancelled, ErrorKind, GuardError, PoolError,
    RetryError, RetryFailure,
};
pub use guard::GuardedBackend;
#[cfg(feature = "prometheus")]
pub use metrics::PrometheusSink;
pub use metrics::{MetricSink, NullMetricSink, RetryOutcome};
pub use pool::{ConnectionPool, Dialer, PoolStats, PooledConnection, Resource};
pub use retry::{backoff_delay, Retrier};
pub use settings::{Settings, SettingsError, DEFAULT_ENV_PREFIX};
pub use state::{BreakerSnapshot, State};
