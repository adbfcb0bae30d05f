//! Bounded pool of reusable connections.
//!
//! A [`ConnectionPool`] owns up to `max_conns` resources produced by a
//! [`Dialer`]. Callers check one out with [`ConnectionPool::get`] and get a
//! [`PooledConnection`] guard back; dropping the guard returns the
//! connection. When the pool is full, callers park on a per-waiter oneshot
//! channel and a returning connection is handed straight to the oldest of
//! them.
//!
//! A background task evicts stale free connections and tops the pool back
//! up to `min_conns` every `cleanup_interval`.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use futures::future::{join_all, BoxFuture, FutureExt};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{PoolBuilder, PoolConfig};
use crate::error::{BoxError, Cancelled, PoolError};
use crate::metrics::{MetricSink, NullMetricSink};

/// A pooled resource.
pub trait Resource: Send + Sync + 'static {
    /// Releases the underlying connection. Called at most once per resource.
    fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Opens new connections for a pool.
///
/// Implemented for any `Fn(CancellationToken) -> Future<Output = Result<R, BoxError>>`.
pub trait Dialer<R>: Send + Sync + 'static {
    /// Opens one connection. The token fires if the caller gives up or the pool shuts down.
    fn dial(&self, token: CancellationToken) -> BoxFuture<'static, Result<R, BoxError>>;
}

impl<R, F, Fut> Dialer<R> for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
    fn dial(&self, token: CancellationToken) -> BoxFuture<'static, Result<R, BoxError>> {
        self(token).boxed()
    }
}

/// Occupancy of a pool at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, in use or free.
    pub total: usize,
    /// Connections checked out.
    pub active: usize,
    /// Connections free for checkout.
    pub idle: usize,
    /// Callers parked waiting for a connection.
    pub waiting: usize,
}

struct Tracked<R> {
    resource: Arc<R>,
    closed: OnceCell<()>,
}

impl<R: Resource> Tracked<R> {
    fn new(resource: R) -> Self {
        Self {
            resource: Arc::new(resource),
            closed: OnceCell::new(),
        }
    }

    /// `None` if the resource was already closed.
    fn close_once(&self) -> Option<Result<(), BoxError>> {
        let mut result = None;
        self.closed.get_or_init(|| {
            result = Some(self.resource.close());
        });
        result
    }
}

struct Slot<R> {
    conn: Arc<Tracked<R>>,
    created_at: Instant,
    last_used_at: Instant,
    in_use: bool,
}

impl<R> Slot<R> {
    fn new(conn: Arc<Tracked<R>>, now: Instant, in_use: bool) -> Self {
        Self {
            conn,
            created_at: now,
            last_used_at: now,
            in_use,
        }
    }

    fn expired(&self, config: &PoolConfig, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > config.max_lifetime
    }

    fn is_stale(&self, config: &PoolConfig, now: Instant) -> bool {
        self.expired(config, now)
            || now.saturating_duration_since(self.last_used_at) > config.max_idle_time
    }
}

enum Handoff<R: Resource> {
    Ready(PooledConnection<R>),
    /// Capacity freed up; run the checkout again.
    Retry,
}

struct Waiter<R: Resource> {
    id: u64,
    tx: oneshot::Sender<Handoff<R>>,
}

struct PoolState<R: Resource> {
    slots: AHashMap<u64, Slot<R>>,
    waiters: VecDeque<Waiter<R>>,
    dialing: usize,
    closed: bool,
    next_id: u64,
}

impl<R: Resource> PoolState<R> {
    fn size(&self) -> usize {
        self.slots.len() + self.dialing
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn evict_stale(&mut self, config: &PoolConfig, now: Instant) -> Vec<Arc<Tracked<R>>> {
        let stale: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.in_use && slot.is_stale(config, now))
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.slots.remove(&id))
            .map(|slot| slot.conn)
            .collect()
    }

    fn stats(&self) -> PoolStats {
        let total = self.slots.len();
        let active = self.slots.values().filter(|slot| slot.in_use).count();
        PoolStats {
            total,
            active,
            idle: total - active,
            waiting: self.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
        }
    }
}

enum Checkout<R: Resource> {
    Ready(PooledConnection<R>),
    Dial(DialReservation<R>),
    Wait(u64, oneshot::Receiver<Handoff<R>>),
    Closed,
    Cancelled,
}

enum Wake<R: Resource> {
    Handoff(Handoff<R>),
    Closed,
    Cancelled,
    TimedOut,
}

struct Shared<R: Resource> {
    name: String,
    config: PoolConfig,
    dialer: Box<dyn Dialer<R>>,
    state: Mutex<PoolState<R>>,
    shutdown: CancellationToken,
    metric_sink: Arc<dyn MetricSink>,
}

impl<R: Resource> Shared<R> {
    fn lease(self: &Arc<Self>, id: u64, conn: Arc<Tracked<R>>) -> PooledConnection<R> {
        PooledConnection {
            id,
            conn,
            pool: Some(Arc::clone(self)),
        }
    }

    fn reserve_one(self: &Arc<Self>, state: &mut PoolState<R>) -> DialReservation<R> {
        state.dialing += 1;
        DialReservation {
            shared: Arc::clone(self),
            pending: true,
        }
    }

    fn reserve(self: &Arc<Self>, state: &mut PoolState<R>, count: usize) -> Vec<DialReservation<R>> {
        (0..count).map(|_| self.reserve_one(state)).collect()
    }

    fn checkout(self: &Arc<Self>, token: &CancellationToken) -> Checkout<R> {
        let now = Instant::now();
        let (checkout, evicted) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return Checkout::Closed;
            }
            if token.is_cancelled() {
                return Checkout::Cancelled;
            }

            let evicted = state.evict_stale(&self.config, now);
            let free = state
                .slots
                .iter()
                .find(|(_, slot)| !slot.in_use)
                .map(|(id, _)| *id);

            let claimed = free.and_then(|id| {
                let slot = state.slots.get_mut(&id)?;
                slot.in_use = true;
                slot.last_used_at = now;
                Some((id, Arc::clone(&slot.conn)))
            });

            let checkout = match claimed {
                Some((id, conn)) => Checkout::Ready(self.lease(id, conn)),
                None if state.size() < self.config.max_conns => {
                    Checkout::Dial(self.reserve_one(state))
                }
                None => {
                    let id = state.next_id();
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(Waiter { id, tx });
                    Checkout::Wait(id, rx)
                }
            };
            (checkout, evicted)
        };

        if !evicted.is_empty() {
            for conn in &evicted {
                self.close_conn(conn, "stale");
            }
            self.wake_all();
        }
        checkout
    }

    /// Returns a checked-out connection to service, or retires it.
    fn release(self: &Arc<Self>, id: u64, conn: Arc<Tracked<R>>) {
        let now = Instant::now();
        let mut retire = None;
        let mut wake = false;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let expired = match state.slots.get_mut(&id) {
                _ if state.closed => {
                    retire = Some("closed");
                    false
                }
                None => {
                    retire = Some("closed");
                    false
                }
                Some(slot) if slot.expired(&self.config, now) => true,
                Some(slot) => {
                    slot.last_used_at = now;
                    slot.in_use = self.offer(&mut state.waiters, id, &conn);
                    false
                }
            };
            if expired {
                state.slots.remove(&id);
                retire = Some("retired");
                wake = true;
            }
        }

        if let Some(reason) = retire {
            debug!(pool = %self.name, id, reason, "connection removed on return");
            self.close_conn(&conn, reason);
        }
        if wake {
            self.wake_all();
        }
    }

    /// Hands a free connection to the oldest live waiter. Called with the lock held.
    fn offer(
        self: &Arc<Self>,
        waiters: &mut VecDeque<Waiter<R>>,
        id: u64,
        conn: &Arc<Tracked<R>>,
    ) -> bool {
        while let Some(waiter) = waiters.pop_front() {
            match waiter.tx.send(Handoff::Ready(self.lease(id, Arc::clone(conn)))) {
                Ok(()) => return true,
                // Receiver is gone; the lease must not re-enter the lock on drop.
                Err(Handoff::Ready(mut lease)) => lease.disarm(),
                Err(Handoff::Retry) => {}
            }
        }
        false
    }

    fn wake_all(&self) {
        let waiters: Vec<Waiter<R>> = self.state.lock().waiters.drain(..).collect();
        for waiter in waiters {
            let _ = waiter.tx.send(Handoff::Retry);
        }
    }

    /// Withdraws a waiter, returning any connection that was handed to it in the meantime.
    fn abandon(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<Handoff<R>>,
    ) -> Option<PooledConnection<R>> {
        self.state.lock().waiters.retain(|w| w.id != id);
        rx.close();
        match rx.try_recv() {
            Ok(Handoff::Ready(conn)) => Some(conn),
            Ok(Handoff::Retry) => {
                self.wake_all();
                None
            }
            Err(_) => None,
        }
    }

    async fn dial(&self, token: &CancellationToken) -> Result<R, PoolError> {
        let timeout = self.config.dial_timeout;
        let dial = self.dialer.dial(token.child_token());
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Cancelled.into()),
            result = tokio::time::timeout(timeout, dial) => match result {
                Ok(Ok(resource)) => Ok(resource),
                Ok(Err(e)) => Err(PoolError::Dial(e)),
                Err(_) => Err(PoolError::DialTimeout(timeout)),
            },
        }
    }

    /// Dials one idle connection per reservation.
    async fn fill(self: &Arc<Self>, reservations: Vec<DialReservation<R>>) {
        if reservations.is_empty() {
            return;
        }
        let dials = reservations.into_iter().map(|reservation| async move {
            match self.dial(&self.shutdown).await {
                Ok(resource) => reservation.idle(resource),
                Err(PoolError::Cancelled(_)) => {}
                Err(e) => {
                    error!(pool = %self.name, error = %e, "failed to create connection");
                    self.metric_sink.record_pool_error(&self.name, e.label());
                }
            }
        });
        join_all(dials).await;
    }

    async fn maintain(self: &Arc<Self>) {
        let now = Instant::now();
        let (evicted, reservations) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            let evicted = state.evict_stale(&self.config, now);
            let target = self.config.min_conns.min(self.config.max_conns);
            let wanted = target.saturating_sub(state.size());
            (evicted, self.reserve(state, wanted))
        };

        if !evicted.is_empty() {
            debug!(pool = %self.name, count = evicted.len(), "evicted stale connections");
            for conn in &evicted {
                self.close_conn(conn, "stale");
            }
            self.wake_all();
        }
        self.fill(reservations).await;
        self.report();
    }

    /// Closes a connection unless it was already closed. Returns the close error, if any.
    fn close_conn(&self, conn: &Tracked<R>, reason: &str) -> Option<BoxError> {
        let result = conn.close_once()?;
        self.metric_sink.record_connection_removed(&self.name, reason);
        match result {
            Ok(()) => None,
            Err(e) => {
                error!(pool = %self.name, reason, error = %e, "failed to close connection");
                self.metric_sink.record_pool_error(&self.name, "close");
                Some(e)
            }
        }
    }

    fn stats(&self) -> PoolStats {
        self.state.lock().stats()
    }

    fn report(&self) {
        let stats = self.stats();
        self.metric_sink.record_pool_stats(&self.name, &stats);
    }
}

/// A slot counted against `max_conns` while its dial is in flight.
///
/// Dropping it unused gives the slot back and wakes waiters.
struct DialReservation<R: Resource> {
    shared: Arc<Shared<R>>,
    pending: bool,
}

impl<R: Resource> DialReservation<R> {
    fn checked_out(mut self, resource: R) -> Result<PooledConnection<R>, PoolError> {
        self.pending = false;
        let shared = Arc::clone(&self.shared);
        let conn = Arc::new(Tracked::new(resource));
        let lease = {
            let mut state = shared.state.lock();
            state.dialing -= 1;
            if state.closed {
                None
            } else {
                let id = state.next_id();
                state
                    .slots
                    .insert(id, Slot::new(Arc::clone(&conn), Instant::now(), true));
                Some(shared.lease(id, Arc::clone(&conn)))
            }
        };

        shared.metric_sink.record_connection_created(&shared.name);
        match lease {
            Some(lease) => {
                debug!(pool = %shared.name, id = lease.id, "connection created");
                Ok(lease)
            }
            None => {
                shared.close_conn(&conn, "closed");
                Err(PoolError::Closed)
            }
        }
    }

    fn idle(mut self, resource: R) {
        self.pending = false;
        let shared = Arc::clone(&self.shared);
        let conn = Arc::new(Tracked::new(resource));
        let added = {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            state.dialing -= 1;
            if state.closed {
                false
            } else {
                let id = state.next_id();
                let handed = shared.offer(&mut state.waiters, id, &conn);
                state
                    .slots
                    .insert(id, Slot::new(Arc::clone(&conn), Instant::now(), handed));
                true
            }
        };

        shared.metric_sink.record_connection_created(&shared.name);
        if added {
            debug!(pool = %shared.name, "idle connection created");
        } else {
            shared.close_conn(&conn, "closed");
        }
    }
}

impl<R: Resource> Drop for DialReservation<R> {
    fn drop(&mut self) {
        if self.pending {
            self.shared.state.lock().dialing -= 1;
            self.shared.wake_all();
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to the resource. Dropping it returns the connection to the
/// pool, or closes it if the pool has been closed or the connection has
/// outlived `max_lifetime`.
pub struct PooledConnection<R: Resource> {
    id: u64,
    conn: Arc<Tracked<R>>,
    pool: Option<Arc<Shared<R>>>,
}

impl<R: Resource> PooledConnection<R> {
    /// Identifier of the connection within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Shared handle to the resource, for operations that outlive a borrow.
    pub fn resource(&self) -> Arc<R> {
        Arc::clone(&self.conn.resource)
    }

    fn disarm(&mut self) {
        self.pool = None;
    }
}

impl<R: Resource> Deref for PooledConnection<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.conn.resource
    }
}

impl<R: Resource> Drop for PooledConnection<R> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(self.id, Arc::clone(&self.conn));
        }
    }
}

impl<R: Resource> fmt::Debug for PooledConnection<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A bounded pool of connections to one backend.
pub struct ConnectionPool<R: Resource> {
    shared: Arc<Shared<R>>,
}

impl<R: Resource> ConnectionPool<R> {
    /// Creates a pool, pre-warms it to `min_conns` and starts its maintenance task.
    ///
    /// Pre-warm failures are logged, not returned. Must be called within a
    /// tokio runtime.
    pub async fn new<D>(name: impl Into<String>, config: PoolConfig, dialer: D) -> Self
    where
        D: Dialer<R>,
    {
        Self::from_parts(name.into(), config, Box::new(dialer), Arc::new(NullMetricSink)).await
    }

    /// Creates a builder around the function that opens new connections.
    pub fn builder<D>(dialer: D) -> PoolBuilder<R>
    where
        D: Dialer<R>,
    {
        PoolBuilder::new(dialer)
    }

    pub(crate) async fn from_parts(
        name: String,
        config: PoolConfig,
        dialer: Box<dyn Dialer<R>>,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Self {
        let shared = Arc::new(Shared {
            name,
            config,
            dialer,
            state: Mutex::new(PoolState {
                slots: AHashMap::new(),
                waiters: VecDeque::new(),
                dialing: 0,
                closed: false,
                next_id: 0,
            }),
            shutdown: CancellationToken::new(),
            metric_sink,
        });

        let warm = shared.config.min_conns.min(shared.config.max_conns);
        let reservations = {
            let mut state = shared.state.lock();
            shared.reserve(&mut state, warm)
        };
        shared.fill(reservations).await;

        let stats = shared.stats();
        info!(
            pool = %shared.name,
            connections = stats.total,
            max = shared.config.max_conns,
            "connection pool ready"
        );
        shared.report();

        spawn_maintenance(&shared);
        Self { shared }
    }

    /// Name used in logs and metric labels.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Checks out a connection.
    ///
    /// Reuses a free connection, dials a new one while below `max_conns`, or
    /// waits up to `idle_timeout` for one to be returned. Fails with
    /// [`PoolError::Closed`], [`PoolError::Exhausted`], a dial error, or
    /// [`PoolError::Cancelled`] if `token` fires first.
    pub async fn get(&self, token: &CancellationToken) -> Result<PooledConnection<R>, PoolError> {
        let started = Instant::now();
        let deadline = started + self.shared.config.idle_timeout;
        let result = self.acquire(token, deadline).await;

        self.shared
            .metric_sink
            .record_pool_get(&self.shared.name, started.elapsed());
        if let Err(e) = &result {
            debug!(pool = %self.shared.name, error = %e, "failed to get connection");
            self.shared
                .metric_sink
                .record_pool_error(&self.shared.name, e.label());
        }
        self.shared.report();
        result
    }

    async fn acquire(
        &self,
        token: &CancellationToken,
        deadline: Instant,
    ) -> Result<PooledConnection<R>, PoolError> {
        loop {
            let (id, mut rx) = match self.shared.checkout(token) {
                Checkout::Ready(conn) => return Ok(conn),
                Checkout::Dial(reservation) => {
                    let resource = self.shared.dial(token).await?;
                    return reservation.checked_out(resource);
                }
                Checkout::Wait(id, rx) => (id, rx),
                Checkout::Closed => return Err(PoolError::Closed),
                Checkout::Cancelled => return Err(Cancelled.into()),
            };

            debug!(pool = %self.shared.name, "waiting for a free connection");
            let wake = tokio::select! {
                biased;
                _ = token.cancelled() => Wake::Cancelled,
                handoff = &mut rx => match handoff {
                    Ok(handoff) => Wake::Handoff(handoff),
                    Err(_) => Wake::Closed,
                },
                _ = tokio::time::sleep_until(deadline) => Wake::TimedOut,
            };

            match wake {
                Wake::Handoff(Handoff::Ready(conn)) => return Ok(conn),
                Wake::Handoff(Handoff::Retry) => {}
                Wake::Closed => return Err(PoolError::Closed),
                Wake::Cancelled => {
                    drop(self.shared.abandon(id, rx));
                    return Err(Cancelled.into());
                }
                Wake::TimedOut => return self.shared.abandon(id, rx).ok_or(PoolError::Exhausted),
            }
        }
    }

    /// Returns a connection to the pool. Same as dropping it.
    pub fn put(&self, conn: PooledConnection<R>) {
        drop(conn);
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Closes the pool and every connection it tracks, in use or not.
    ///
    /// Parked callers fail with [`PoolError::Closed`]; connections still
    /// checked out are not closed again when returned. Returns the last close
    /// error, if any. Calling it again is a no-op.
    pub fn close(&self) -> Result<(), PoolError> {
        let (conns, waiters) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let conns: Vec<Arc<Tracked<R>>> = state.slots.drain().map(|(_, slot)| slot.conn).collect();
            let waiters: Vec<Waiter<R>> = state.waiters.drain(..).collect();
            (conns, waiters)
        };
        self.shared.shutdown.cancel();
        drop(waiters);

        let count = conns.len();
        let mut last_error = None;
        for conn in &conns {
            if let Some(e) = self.shared.close_conn(conn, "closed") {
                last_error = Some(e);
            }
        }

        info!(pool = %self.shared.name, connections = count, "connection pool closed");
        self.shared.report();
        match last_error {
            Some(e) => Err(PoolError::Close(e)),
            None => Ok(()),
        }
    }
}

impl<R: Resource> Drop for ConnectionPool<R> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl<R: Resource> fmt::Debug for ConnectionPool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

fn spawn_maintenance<R: Resource>(shared: &Arc<Shared<R>>) {
    let weak: Weak<Shared<R>> = Arc::downgrade(shared);
    let shutdown = shared.shutdown.clone();
    let name = shared.name.clone();
    let period = shared.config.cleanup_interval.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stopped = tokio::select! {
                biased;
                _ = shutdown.cancelled() => true,
                _ = ticker.tick() => false,
            };
            if stopped {
                break;
            }
            let Some(shared) = weak.upgrade() else {
                break;
            };
            shared.maintain().await;
        }
        debug!(pool = %name, "pool maintenance stopped");
    });
}
