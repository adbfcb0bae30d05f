use breakwater::{
    BreakerConfig, BreakerError, CircuitBreaker, ErrorClass, MetricSink, Retrier, RetryConfig,
    State,
};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

// Custom error type that implements Error trait
#[derive(Debug)]
struct TestError(String);

impl TestError {
    fn new(msg: &str) -> Self {
        TestError(msg.to_string())
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Test error: {}", self.0)
    }
}

impl Error for TestError {}

fn breaker(failures: u32, reset: Duration, probes: u32, successes: u32) -> CircuitBreaker {
    CircuitBreaker::builder()
        .name("test")
        .failure_threshold(failures)
        .reset_timeout(reset)
        .half_open_max_calls(probes)
        .success_threshold(successes)
        .build()
}

fn retrier(max_attempts: u32, initial: Duration, max: Duration) -> Retrier {
    Retrier::new(
        "test",
        RetryConfig {
            max_attempts,
            initial_delay: initial,
            max_delay: max,
            backoff_factor: 2.0,
            retryable: Vec::new(),
        },
    )
}

fn ok_call() -> Result<String, TestError> {
    Ok("success".to_string())
}

fn failing_call() -> Result<String, TestError> {
    Err(TestError::new("backend timeout"))
}

#[test]
fn test_circuit_breaker_basic_functionality() {
    let breaker = breaker(2, Duration::from_millis(100), 1, 1);
    assert_eq!(breaker.state(), State::Closed);

    // First call, success
    assert_ok!(breaker.call(ok_call));
    assert_eq!(breaker.state(), State::Closed);

    // Two failures trip the breaker
    assert_err!(breaker.call(failing_call));
    assert_eq!(breaker.state(), State::Closed);
    assert_err!(breaker.call(failing_call));
    assert_eq!(breaker.state(), State::Open);

    // Call while open should fail immediately
    let result = breaker.call(ok_call);
    assert!(matches!(result, Err(BreakerError::Open)));

    // Open until the reset timeout has passed, then the next call probes
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(breaker.state(), State::Open);
    assert_ok!(breaker.call(ok_call));
    assert_eq!(breaker.state(), State::Closed);
}

#[test]
fn test_end_to_end_trip_and_recover() {
    let breaker = breaker(3, Duration::from_millis(100), 2, 2);

    for _ in 0..3 {
        assert_err!(breaker.call(failing_call));
    }
    assert_eq!(breaker.state(), State::Open);

    std::thread::sleep(Duration::from_millis(150));

    assert_ok!(breaker.call(ok_call));
    assert_eq!(breaker.state(), State::HalfOpen);
    assert_ok!(breaker.call(ok_call));
    assert_eq!(breaker.state(), State::Closed);
}

#[test]
fn test_single_half_open_failure_reopens() {
    let breaker = breaker(1, Duration::from_millis(20), 3, 3);
    assert_err!(breaker.call(failing_call));
    std::thread::sleep(Duration::from_millis(40));

    assert_ok!(breaker.call(ok_call));
    assert_eq!(breaker.state(), State::HalfOpen);
    assert_err!(breaker.call(failing_call));
    assert_eq!(breaker.state(), State::Open);
    assert!(matches!(breaker.call(ok_call), Err(BreakerError::Open)));
}

#[test]
fn test_zero_thresholds() {
    let breaker = breaker(0, Duration::from_millis(20), 1, 0);
    assert_err!(breaker.call(failing_call));
    assert_eq!(breaker.state(), State::Open);

    std::thread::sleep(Duration::from_millis(40));
    assert_ok!(breaker.call(ok_call));
    assert_eq!(breaker.state(), State::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_half_open_admission_bound_under_concurrency() {
    let breaker = breaker(1, Duration::from_millis(50), 2, 10);
    assert_err!(breaker.call(failing_call));
    tokio::time::sleep(Duration::from_millis(80)).await;

    let invoked = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let token = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let breaker = breaker.clone();
        let invoked = Arc::clone(&invoked);
        let rejected = Arc::clone(&rejected);
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            let result = breaker
                .execute(&token, |_| async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    // Hold the probe slot while the other calls arrive
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, TestError>(())
                })
                .await;
            if matches!(result, Err(BreakerError::Open)) {
                rejected.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let invoked = invoked.load(Ordering::SeqCst);
    assert!((1..=2).contains(&invoked), "{invoked} probes admitted");
    assert_eq!(invoked + rejected.load(Ordering::SeqCst), 10);
}

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_after_max_attempts() {
    let calls = AtomicU32::new(0);
    let token = CancellationToken::new();
    let retrier = retrier(3, Duration::from_millis(100), Duration::from_secs(2));

    let result = retrier
        .run(&token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { failing_call() }
        })
        .await;

    let failure = assert_err!(result);
    let report = failure.retry_error().expect("attempts exhausted");
    assert_eq!(report.attempt, 3);
    assert_eq!(report.error.to_string(), "Test error: backend timeout");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_stops_at_first_attempt() {
    let calls = AtomicU32::new(0);
    let token = CancellationToken::new();
    let retrier = retrier(5, Duration::from_millis(100), Duration::from_secs(2));

    let result = retrier
        .run(&token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::new("validation failed: empty template")) }
        })
        .await;

    let failure = assert_err!(result);
    assert_eq!(failure.retry_error().map(|e| e.attempt), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_allow_list_limits_retries() {
    let calls = AtomicU32::new(0);
    let token = CancellationToken::new();
    let retrier = Retrier::builder()
        .max_attempts(4)
        .initial_delay(Duration::from_millis(10))
        .retry_on(ErrorClass::Connection)
        .build();

    // A timeout is not on the list, so it is not retried.
    let result = retrier
        .run(&token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { failing_call() }
        })
        .await;

    assert_eq!(assert_err!(result).retry_error().map(|e| e.attempt), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff() {
    let calls = AtomicU32::new(0);
    let token = CancellationToken::new();
    let retrier = retrier(5, Duration::from_secs(1), Duration::from_secs(10));

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = retrier
        .run(&token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { failing_call() }
        })
        .await;

    assert!(assert_err!(result).is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_retrier_retries_circuit_open_rejections() {
    let breaker = breaker(1, Duration::from_secs(60), 1, 1);
    let retrier = retrier(3, Duration::from_millis(10), Duration::from_millis(100));
    let invoked = AtomicU32::new(0);
    let token = CancellationToken::new();

    let result = retrier
        .run(&token, |attempt| {
            let breaker = &breaker;
            let invoked = &invoked;
            async move {
                breaker
                    .execute(&attempt, |_| async move {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        failing_call()
                    })
                    .await
            }
        })
        .await;

    // The first attempt trips the breaker; the rest are rejected without running.
    let failure = assert_err!(result);
    let report = failure.retry_error().expect("attempts exhausted");
    assert_eq!(report.attempt, 3);
    assert!(report.error.is_open());
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct RecordingSink {
    transitions: Mutex<Vec<(State, State)>>,
    recoveries: AtomicUsize,
    rejections: AtomicUsize,
}

impl MetricSink for RecordingSink {
    fn record_state_transition(&self, _breaker: &str, from: State, to: State) {
        self.transitions.lock().unwrap().push((from, to));
    }

    fn record_rejection(&self, _breaker: &str, _state: State) {
        self.rejections.fetch_add(1, Ordering::SeqCst);
    }

    fn record_recovery(&self, _breaker: &str, _duration: Duration) {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_transitions_reach_the_metric_sink() {
    let sink = Arc::new(RecordingSink::default());
    let breaker = CircuitBreaker::with_sink(
        "observed",
        BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(20),
            half_open_max_calls: 1,
            success_threshold: 1,
        },
        sink.clone(),
    );

    assert_err!(breaker.call(failing_call));
    assert_err!(breaker.call(ok_call));
    std::thread::sleep(Duration::from_millis(40));
    assert_ok!(breaker.call(ok_call));

    assert_eq!(
        *sink.transitions.lock().unwrap(),
        vec![
            (State::Closed, State::Open),
            (State::Open, State::HalfOpen),
            (State::HalfOpen, State::Closed),
        ]
    );
    assert_eq!(sink.rejections.load(Ordering::SeqCst), 1);
    assert_eq!(sink.recoveries.load(Ordering::SeqCst), 1);
}

// Holds up the first report of a recovery so a later trip is made while it is in flight.
#[derive(Default)]
struct SlowGaugeSink {
    transitions: Mutex<Vec<(State, State)>>,
    gauge: Mutex<Option<State>>,
    delayed: AtomicUsize,
}

impl MetricSink for SlowGaugeSink {
    fn record_state_transition(&self, _breaker: &str, from: State, to: State) {
        if (from, to) == (State::HalfOpen, State::Closed)
            && self.delayed.fetch_add(1, Ordering::SeqCst) == 0
        {
            std::thread::sleep(Duration::from_millis(200));
        }
        self.transitions.lock().unwrap().push((from, to));
        *self.gauge.lock().unwrap() = Some(to);
    }
}

#[test]
fn test_sink_sees_transitions_in_order_under_concurrency() {
    let sink = Arc::new(SlowGaugeSink::default());
    let breaker = CircuitBreaker::with_sink(
        "ordered",
        BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(20),
            half_open_max_calls: 1,
            success_threshold: 1,
        },
        sink.clone(),
    );

    assert_err!(breaker.call(failing_call));
    std::thread::sleep(Duration::from_millis(40));

    // Recovers the breaker; reporting HalfOpen -> Closed stalls in the sink.
    let recovering = {
        let breaker = breaker.clone();
        std::thread::spawn(move || breaker.call(ok_call).is_ok())
    };
    std::thread::sleep(Duration::from_millis(50));

    // Trips it again while that report is still in flight.
    assert_err!(breaker.call(failing_call));
    assert!(recovering.join().unwrap());

    assert_eq!(breaker.state(), State::Open);
    assert_eq!(
        *sink.transitions.lock().unwrap(),
        vec![
            (State::Closed, State::Open),
            (State::Open, State::HalfOpen),
            (State::HalfOpen, State::Closed),
            (State::Closed, State::Open),
        ]
    );
    assert_eq!(*sink.gauge.lock().unwrap(), Some(State::Open));
}
