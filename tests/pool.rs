use breakwater::{
    BoxError, ConnectionPool, Dialer, MetricSink, PoolConfig, PoolError, PoolStats, Resource,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

struct Conn {
    id: usize,
    closes: Arc<AtomicUsize>,
    fail_close: bool,
}

impl Resource for Conn {
    fn close(&self) -> Result<(), BoxError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            Err("close failed".into())
        } else {
            Ok(())
        }
    }
}

// Counts dials and closes across every connection it hands out.
#[derive(Clone, Default)]
struct Backend {
    dials: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    fail_close: bool,
}

impl Backend {
    fn dialer(&self) -> impl Dialer<Conn> {
        let backend = self.clone();
        move |_token: CancellationToken| {
            let id = backend.dials.fetch_add(1, Ordering::SeqCst) + 1;
            let closes = Arc::clone(&backend.closes);
            let fail_close = backend.fail_close;
            async move {
                Ok::<_, BoxError>(Conn {
                    id,
                    closes,
                    fail_close,
                })
            }
        }
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

fn config(min_conns: usize, max_conns: usize) -> PoolConfig {
    PoolConfig {
        min_conns,
        max_conns,
        max_idle_time: Duration::from_secs(60),
        max_lifetime: Duration::from_secs(600),
        dial_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(1),
        cleanup_interval: Duration::from_secs(60),
    }
}

async fn pool(backend: &Backend, config: PoolConfig) -> ConnectionPool<Conn> {
    ConnectionPool::builder(backend.dialer())
        .name("test")
        .config(config)
        .build()
        .await
}

#[tokio::test]
async fn test_prewarms_to_min_conns() {
    let backend = Backend::default();
    let pool = pool(&backend, config(2, 4)).await;

    assert_eq!(backend.dials(), 2);
    assert_eq!(
        pool.stats(),
        PoolStats {
            total: 2,
            active: 0,
            idle: 2,
            waiting: 0
        }
    );
}

#[tokio::test]
async fn test_reuses_a_returned_connection() {
    let backend = Backend::default();
    let pool = pool(&backend, config(0, 4)).await;
    let token = CancellationToken::new();

    let first = assert_ok!(pool.get(&token).await);
    let id = first.id;
    assert_eq!(pool.stats().active, 1);
    pool.put(first);

    let second = assert_ok!(pool.get(&token).await);
    assert_eq!(second.id, id);
    assert_eq!(backend.dials(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_connection_is_handed_out_twice() {
    let backend = Backend::default();
    let pool = Arc::new(pool(&backend, config(0, 3)).await);
    let checked_out = Arc::new(Mutex::new(HashSet::new()));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let pool = Arc::clone(&pool);
        let checked_out = Arc::clone(&checked_out);
        handles.push(tokio::spawn(async move {
            let token = CancellationToken::new();
            let conn = pool.get(&token).await.unwrap();
            assert!(checked_out.lock().unwrap().insert(conn.id), "double checkout");

            let stats = pool.stats();
            assert!(stats.active <= stats.total);
            assert!(stats.total <= 3);
            tokio::time::sleep(Duration::from_millis(5)).await;

            checked_out.lock().unwrap().remove(&conn.id);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(backend.dials() <= 3);
    assert_eq!(pool.stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_get_waits_for_a_put() {
    let backend = Backend::default();
    let pool = pool(&backend, config(0, 1)).await;
    let token = CancellationToken::new();

    let held = assert_ok!(pool.get(&token).await);
    let id = held.id;
    let started = Instant::now();

    let (conn, ()) = tokio::join!(pool.get(&token), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);
    });

    let conn = assert_ok!(conn);
    assert_eq!(conn.id, id);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(backend.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_get_fails_when_exhausted() {
    let backend = Backend::default();
    let mut cfg = config(0, 1);
    cfg.idle_timeout = Duration::from_millis(200);
    let pool = pool(&backend, cfg).await;
    let token = CancellationToken::new();

    let _held = assert_ok!(pool.get(&token).await);
    let started = Instant::now();
    let err = assert_err!(pool.get(&token).await);

    assert!(matches!(err, PoolError::Exhausted));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(pool.stats().waiting, 0);
}

#[tokio::test(start_paused = true)]
async fn test_get_returns_cancellation_while_waiting() {
    let backend = Backend::default();
    let pool = pool(&backend, config(0, 1)).await;
    let token = CancellationToken::new();

    let _held = assert_ok!(pool.get(&token).await);

    let waiting = CancellationToken::new();
    let canceller = waiting.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = assert_err!(pool.get(&waiting).await);
    assert!(matches!(err, PoolError::Cancelled(_)));
    assert_eq!(pool.stats().waiting, 0);
}

#[tokio::test]
async fn test_closed_pool_semantics() {
    let backend = Backend::default();
    let pool = pool(&backend, config(1, 2)).await;
    let token = CancellationToken::new();

    let held = assert_ok!(pool.get(&token).await);
    assert_ok!(pool.close());
    assert!(pool.is_closed());
    assert_eq!(backend.closes(), 1);

    // Returning a connection after close does not close it a second time.
    pool.put(held);
    assert_eq!(backend.closes(), 1);

    assert!(matches!(pool.get(&token).await, Err(PoolError::Closed)));
    assert_ok!(pool.close());
    assert_eq!(pool.stats(), PoolStats::default());
}

#[tokio::test]
async fn test_close_wakes_waiters() {
    let backend = Backend::default();
    let pool = Arc::new(pool(&backend, config(0, 1)).await);
    let token = CancellationToken::new();
    let _held = assert_ok!(pool.get(&token).await);

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get(&CancellationToken::new()).await.map(|c| c.id) })
    };
    while pool.stats().waiting == 0 {
        tokio::task::yield_now().await;
    }

    assert_ok!(pool.close());
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
}

#[tokio::test]
async fn test_close_reports_close_errors() {
    let backend = Backend {
        fail_close: true,
        ..Backend::default()
    };
    let pool = pool(&backend, config(2, 2)).await;

    let err = assert_err!(pool.close());
    assert!(matches!(err, PoolError::Close(_)));
    assert_eq!(backend.closes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dial_timeout() {
    let dialer = |_token: CancellationToken| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok::<_, BoxError>(Conn {
            id: 0,
            closes: Arc::default(),
            fail_close: false,
        })
    };
    let pool = ConnectionPool::new("slow", config(0, 1), dialer).await;

    let err = assert_err!(pool.get(&CancellationToken::new()).await);
    assert!(matches!(err, PoolError::DialTimeout(d) if d == Duration::from_secs(1)));

    // The reserved slot was given back.
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test]
async fn test_failed_dial_frees_capacity() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let dialer = move |_token: CancellationToken| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                Err::<Conn, BoxError>("connection refused".into())
            } else {
                Ok(Conn {
                    id: n,
                    closes: Arc::default(),
                    fail_close: false,
                })
            }
        }
    };
    let pool = ConnectionPool::new("flaky", config(0, 1), dialer).await;
    let token = CancellationToken::new();

    let err = assert_err!(pool.get(&token).await);
    assert!(matches!(err, PoolError::Dial(_)));
    let conn = assert_ok!(pool.get(&token).await);
    assert_eq!(conn.id, 1);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_evicts_idle_and_tops_up() {
    let backend = Backend::default();
    let mut cfg = config(1, 2);
    cfg.max_idle_time = Duration::from_secs(1);
    cfg.cleanup_interval = Duration::from_millis(500);
    let pool = pool(&backend, cfg).await;
    assert_eq!(backend.dials(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;

    // The idle connection was replaced.
    assert_eq!(backend.closes(), 1);
    assert_eq!(backend.dials(), 2);
    assert_eq!(pool.stats().total, 1);

    let conn = assert_ok!(pool.get(&CancellationToken::new()).await);
    assert_eq!(conn.id, 2);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_skips_connections_in_use() {
    let backend = Backend::default();
    let mut cfg = config(0, 1);
    cfg.max_idle_time = Duration::from_millis(100);
    cfg.cleanup_interval = Duration::from_millis(50);
    let pool = pool(&backend, cfg).await;

    let held = assert_ok!(pool.get(&CancellationToken::new()).await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(backend.closes(), 0);
    assert_eq!(pool.stats().active, 1);
    drop(held);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_connection_is_retired_on_put() {
    let backend = Backend::default();
    let mut cfg = config(0, 1);
    cfg.max_lifetime = Duration::from_secs(1);
    let pool = pool(&backend, cfg).await;

    let held = assert_ok!(pool.get(&CancellationToken::new()).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    pool.put(held);

    assert_eq!(backend.closes(), 1);
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_get_replaces_a_stale_free_connection() {
    let backend = Backend::default();
    let mut cfg = config(0, 2);
    cfg.max_idle_time = Duration::from_secs(1);
    cfg.cleanup_interval = Duration::from_secs(3600);
    let pool = pool(&backend, cfg).await;
    let token = CancellationToken::new();

    let first = assert_ok!(pool.get(&token).await);
    let first_id = first.id;
    pool.put(first);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let second = assert_ok!(pool.get(&token).await);
    assert_ne!(second.id, first_id);
    assert_eq!(backend.closes(), 1);
    assert_eq!(backend.dials(), 2);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test]
async fn test_cancelled_token_gets_nothing_even_with_free_connections() {
    let backend = Backend::default();
    let pool = pool(&backend, config(1, 2)).await;
    let token = CancellationToken::new();
    token.cancel();

    let err = assert_err!(pool.get(&token).await);
    assert!(matches!(err, PoolError::Cancelled(_)));
    assert_eq!(pool.stats().active, 0);
    assert_eq!(backend.dials(), 1);
}

#[derive(Default)]
struct GetTimings {
    gets: Mutex<Vec<Duration>>,
}

impl MetricSink for GetTimings {
    fn record_pool_get(&self, _pool: &str, duration: Duration) {
        self.gets.lock().unwrap().push(duration);
    }
}

#[tokio::test(start_paused = true)]
async fn test_get_duration_is_recorded_for_failed_gets() {
    let backend = Backend::default();
    let timings = Arc::new(GetTimings::default());
    let mut cfg = config(0, 1);
    cfg.idle_timeout = Duration::from_millis(300);
    let pool = ConnectionPool::builder(backend.dialer())
        .name("timed")
        .config(cfg)
        .shared_metric_sink(timings.clone())
        .build()
        .await;
    let token = CancellationToken::new();

    let _held = assert_ok!(pool.get(&token).await);
    assert!(matches!(pool.get(&token).await, Err(PoolError::Exhausted)));

    let gets = timings.gets.lock().unwrap();
    assert_eq!(gets.len(), 2);
    assert!(gets[1] >= Duration::from_millis(300));
}
