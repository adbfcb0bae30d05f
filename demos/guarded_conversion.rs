//! Guarded conversion example
//!
//! Runs document conversions against a simulated backend that fails for a
//! while and then recovers. Shows:
//! 1. Loading tunables from `BREAKWATER_*` environment variables
//! 2. Composing the pool, breaker and retrier into a `GuardedBackend`
//! 3. How each failure surfaces to the caller
//!
//! Run with `RUST_LOG=breakwater=debug` to see the breaker and retry logs.

use breakwater::{
    BoxError, CircuitBreaker, ConnectionPool, GuardError, GuardedBackend, Resource, Retrier,
    Settings,
};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// One HTTP session to the conversion service.
struct Session {
    id: usize,
}

impl Resource for Session {
    fn close(&self) -> Result<(), BoxError> {
        println!("closing session {}", self.id);
        Ok(())
    }
}

// Fails the first `outage` conversions, then succeeds.
struct FlakyConverter {
    calls: AtomicU32,
    outage: u32,
}

impl FlakyConverter {
    async fn convert(&self, session: &Session, document: &str) -> Result<Vec<u8>, io::Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;

        if document.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty document"));
        }
        if call <= self.outage {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("session {}: connection refused", session.id),
            ));
        }
        Ok(format!("%PDF-1.7 {document}").into_bytes())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Guarded Conversion Example ===\n");

    let mut settings = Settings::from_env()?;
    settings.breaker.failure_threshold = 3;
    settings.breaker.reset_timeout = Duration::from_millis(500);
    settings.retry.max_attempts = 2;
    settings.retry.initial_delay = Duration::from_millis(50);
    settings.pool.min_conns = 1;
    settings.pool.max_conns = 2;
    settings.validate()?;

    let sessions = Arc::new(AtomicUsize::new(0));
    let dialed = Arc::clone(&sessions);
    let pool = ConnectionPool::builder(move |_token: CancellationToken| {
        let id = dialed.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok::<_, BoxError>(Session { id }) }
    })
    .name("converter")
    .config(settings.pool.clone())
    .build()
    .await;

    let backend = GuardedBackend::new(
        Arc::new(pool),
        CircuitBreaker::builder()
            .name("converter")
            .config(settings.breaker.clone())
            .build(),
        Retrier::builder()
            .operation("convert")
            .config(settings.retry.clone())
            .build(),
    );

    let converter = Arc::new(FlakyConverter {
        calls: AtomicU32::new(0),
        outage: 4,
    });
    let token = CancellationToken::new();

    let documents = ["invoice", "report", "letter", "", "memo", "brochure"];
    for (i, document) in documents.iter().enumerate() {
        if i == 4 {
            println!("\nwaiting for the reset timeout...\n");
            tokio::time::sleep(settings.breaker.reset_timeout + Duration::from_millis(50)).await;
        }

        let result = backend
            .call(&token, |session, _token| {
                let converter = Arc::clone(&converter);
                async move { converter.convert(&session, document).await }
            })
            .await;

        match result {
            Ok(pdf) => println!("{document:>10}: converted ({} bytes)", pdf.len()),
            Err(GuardError::CircuitOpen { attempts }) => {
                println!("{document:>10}: rejected, circuit open after {attempts} attempt(s)")
            }
            Err(GuardError::Retry(report)) => println!(
                "{document:>10}: failed at attempt {}: {}",
                report.attempt, report.error
            ),
            Err(err) => println!("{document:>10}: {} ({err})", err.kind()),
        }
        println!(
            "{:>10}  breaker: {}, pool: {:?}",
            "",
            backend.state(),
            backend.stats()
        );
    }

    backend.pool().close()?;
    println!("\nsessions dialed: {}", sessions.load(Ordering::SeqCst));
    Ok(())
}
