//! Re-exports common types for convenient usage.
//!
//! # Example
//! ```rust,no_run
//! use breakwater::prelude::*;
//! ```

pub use crate::breaker::CircuitBreaker;
pub use crate::config::{BreakerConfig, PoolConfig, RetryConfig};
pub use crate::error::{BoxError, BreakerError, Cancelled, GuardError, PoolError, RetryError};
pub use crate::guard::GuardedBackend;
pub use crate::pool::{ConnectionPool, PooledConnection, Resource};
pub use crate::retry::Retrier;
pub use crate::state::State;
pub use tokio_util::sync::CancellationToken;
