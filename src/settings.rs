//! Environment-driven settings.
//!
//! Variables take the form `<PREFIX>_<SECTION>__<FIELD>`, for example
//! `BREAKWATER_BREAKER__FAILURE_THRESHOLD=5` or
//! `BREAKWATER_RETRY__RETRYABLE=timeout,connection`. Anything unset keeps its
//! default.

use serde::Deserialize;
use thiserror::Error;

use crate::config::{BreakerConfig, PoolConfig, RetryConfig};

/// Prefix used by [`Settings::from_env`].
pub const DEFAULT_ENV_PREFIX: &str = "BREAKWATER";

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The environment could not be read or a value did not parse.
    #[error("failed to load settings: {0}")]
    Load(#[from] ::config::ConfigError),

    /// A value parsed but is out of range.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Configuration for the breaker, retrier and pool of one backend.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Circuit breaker tunables.
    pub breaker: BreakerConfig,
    /// Retry tunables.
    pub retry: RetryConfig,
    /// Connection pool tunables.
    pub pool: PoolConfig,
}

impl Settings {
    /// Loads settings from `BREAKWATER_*` environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_env_with_prefix(DEFAULT_ENV_PREFIX)
    }

    /// Loads settings from `<prefix>_*` environment variables.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, SettingsError> {
        let source = ::config::Environment::with_prefix(prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("retry.retryable");

        let settings: Settings = ::config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects combinations no component can run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.pool.max_conns == 0 {
            return Err(invalid("pool.max_conns", "must be at least 1"));
        }
        if self.pool.min_conns > self.pool.max_conns {
            return Err(invalid("pool.min_conns", "must not exceed pool.max_conns"));
        }
        if self.pool.cleanup_interval.is_zero() {
            return Err(invalid("pool.cleanup_interval_ms", "must be positive"));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor <= 0.0 {
            return Err(invalid("retry.backoff_factor", "must be a positive number"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(invalid("retry.initial_delay_ms", "must not exceed retry.max_delay_ms"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &'static str) -> SettingsError {
    SettingsError::Invalid { field, reason }
}
