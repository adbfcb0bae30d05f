//! Pool, breaker and retrier composed around one backend.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::breaker::CircuitBreaker;
use crate::error::GuardError;
use crate::pool::{ConnectionPool, PoolStats, Resource};
use crate::retry::Retrier;
use crate::state::State;

type Probe<R, E> =
    Arc<dyn Fn(Arc<R>, CancellationToken) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// Guards calls to a backend reached through pooled connections.
///
/// A call checks out one connection, then runs the operation through the
/// retrier with every attempt passing the circuit breaker:
/// `retrier.run(|| breaker.execute(|| probe(conn) then op(conn)))`. The
/// connection goes back to the pool however the call ends.
pub struct GuardedBackend<R: Resource, E> {
    pool: Arc<ConnectionPool<R>>,
    breaker: CircuitBreaker,
    retrier: Retrier,
    probe: Option<Probe<R, E>>,
}

impl<R, E> GuardedBackend<R, E>
where
    R: Resource,
    E: StdError + 'static,
{
    /// Composes the three guards. The breaker may be shared with other callers.
    pub fn new(pool: Arc<ConnectionPool<R>>, breaker: CircuitBreaker, retrier: Retrier) -> Self {
        Self {
            pool,
            breaker,
            retrier,
            probe: None,
        }
    }

    /// Runs `probe` against the connection before each attempt of the operation.
    ///
    /// A probe failure counts as a failure of that attempt.
    pub fn with_probe<P, Fut>(mut self, probe: P) -> Self
    where
        P: Fn(Arc<R>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.probe = Some(Arc::new(move |resource, token| probe(resource, token).boxed()));
        self
    }

    /// Runs `op` against a pooled connection under the breaker and retrier.
    pub async fn call<F, Fut, T>(&self, token: &CancellationToken, op: F) -> Result<T, GuardError<E>>
    where
        F: Fn(Arc<R>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let conn = self.pool.get(token).await.map_err(|e| {
            warn!(pool = %self.pool.name(), error = %e, "no connection for guarded call");
            GuardError::from(e)
        })?;
        let resource = conn.resource();
        let op = &op;
        let breaker = &self.breaker;

        let result = self
            .retrier
            .run(token, |attempt_token| {
                let resource = Arc::clone(&resource);
                let probe = self.probe.clone();
                async move {
                    breaker
                        .execute(&attempt_token, move |token| async move {
                            if let Some(probe) = probe {
                                probe(Arc::clone(&resource), token.clone()).await?;
                            }
                            op(resource, token).await
                        })
                        .await
                }
            })
            .await;

        self.pool.put(conn);
        result.map_err(|failure| {
            let err = GuardError::from(failure);
            warn!(breaker = %self.breaker.name(), kind = %err.kind(), "guarded call failed");
            err
        })
    }

    /// Current breaker state.
    pub fn state(&self) -> State {
        self.breaker.state()
    }

    /// Whether the breaker would currently admit a call.
    pub fn is_healthy(&self) -> bool {
        self.breaker.is_healthy()
    }

    /// Current pool occupancy.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool<R>> {
        &self.pool
    }

    /// The retrier.
    pub fn retrier(&self) -> &Retrier {
        &self.retrier
    }
}

impl<R: Resource, E> fmt::Debug for GuardedBackend<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedBackend")
            .field("pool", &self.pool)
            .field("breaker", &self.breaker)
            .field("retrier", &self.retrier)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}
