//! Error classification for retry decisions.
//!
//! Structural checks come first: `std::io::Error` kinds, tokio timer
//! expiry and pool dial failures anywhere in the source chain. Failing
//! that, the rendered messages of the chain are matched against known
//! markers, so errors from other libraries that only carry text still
//! classify.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;

use serde::Deserialize;

use crate::error::PoolError;

/// Coarse failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The dependency did not answer in time.
    Timeout,
    /// The dependency could not be reached or dropped the connection.
    Connection,
    /// The request itself was rejected. Retrying cannot help.
    Validation,
    /// Anything else.
    Unknown,
}

impl ErrorClass {
    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::Connection => "connection",
            ErrorClass::Validation => "validation",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Whether a failure of this class is retried when no allow-list is set.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorClass::Validation)
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const CONNECTION_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "no such host",
    "network is unreachable",
    "broken pipe",
];

const VALIDATION_MARKERS: &[&str] = &[
    "validation failed",
    "invalid input",
    "bad request",
    "status 400",
];

/// Classifies an error by walking its source chain.
pub fn classify(err: &(dyn StdError + 'static)) -> ErrorClass {
    if let Some(class) = chain(err).find_map(structural) {
        return class;
    }

    for cause in chain(err) {
        let message = cause.to_string().to_lowercase();
        if contains_any(&message, TIMEOUT_MARKERS) {
            return ErrorClass::Timeout;
        }
        if contains_any(&message, CONNECTION_MARKERS) {
            return ErrorClass::Connection;
        }
        if contains_any(&message, VALIDATION_MARKERS) {
            return ErrorClass::Validation;
        }
    }

    ErrorClass::Unknown
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

fn structural(err: &(dyn StdError + 'static)) -> Option<ErrorClass> {
    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        return match io_err.kind() {
            io::ErrorKind::TimedOut => Some(ErrorClass::Timeout),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe => Some(ErrorClass::Connection),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                Some(ErrorClass::Validation)
            }
            _ => None,
        };
    }
    if err.is::<tokio::time::error::Elapsed>() {
        return Some(ErrorClass::Timeout);
    }
    match err.downcast_ref::<PoolError>() {
        Some(PoolError::DialTimeout(_)) => Some(ErrorClass::Timeout),
        Some(PoolError::Dial(_)) => Some(ErrorClass::Connection),
        _ => None,
    }
}

fn contains_any(message: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| message.contains(m))
}
