//! Erasure stage configuration.
//!
//! Controls how the identifier set is partitioned for each store and how the
//! external analytics API is driven.
//!
//! # Example
//!
//! ```toml
//! [relational]
//! chunk_size = 5000
//! statement_timeout_secs = 300
//! procedure_path = "sql/erase_users.sql"
//!
//! [external]
//! endpoint = "https://analytics.example.com/api/2/deletions/users"
//! username = "${ANALYTICS_API_KEY}"
//! secret = "${ANALYTICS_SECRET_KEY}"
//! batch_size = 300
//! concurrent_batches = 4
//!
//! [external.retry]
//! max_attempts = 5
//! initial_delay_ms = 500
//! max_delay_ms = 30000
//! ```

use std::{fmt, num::NonZeroUsize, sync::LazyLock, time::Duration};

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ConfigError;

static SQL_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
});

/// Relational purge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationalPurgeConfig {
    /// Maximum identifiers staged per transaction.
    /// Omit to purge the whole set in a single chunk.
    /// Default: unbounded
    #[serde(default)]
    pub chunk_size: Option<NonZeroUsize>,

    /// Statement timeout applied to every chunk transaction (in seconds).
    /// Default: 300 (5 minutes)
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,

    /// Path to the reviewed deletion script run once per chunk.
    /// Required by `lethe run`.
    #[serde(default)]
    pub procedure_path: Option<String>,

    /// Name of the temporary staging relation the script joins against.
    /// It has a single `identifier TEXT` column.
    /// Default: "erasure_targets"
    #[serde(default = "default_staging_table")]
    pub staging_table: String,
}

impl Default for RelationalPurgeConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            statement_timeout_secs: default_statement_timeout_secs(),
            procedure_path: None,
            staging_table: default_staging_table(),
        }
    }
}

fn default_statement_timeout_secs() -> u64 {
    300
}

fn default_staging_table() -> String {
    "erasure_targets".into()
}

impl RelationalPurgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.statement_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "relational.statement_timeout_secs must be greater than 0".into(),
            ));
        }
        if !SQL_IDENTIFIER.is_match(&self.staging_table) {
            return Err(ConfigError::Validation(format!(
                "relational.staging_table '{}' is not a plain SQL identifier",
                self.staging_table
            )));
        }
        if let Some(path) = &self.procedure_path
            && path.trim().is_empty()
        {
            return Err(ConfigError::Validation(
                "relational.procedure_path cannot be empty".into(),
            ));
        }
        Ok(())
    }

    /// Get the statement timeout as a Duration.
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

/// External analytics API client configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalEraserConfig {
    /// Batch deletion endpoint. Required by `lethe run`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Basic auth username (usually the project API key).
    #[serde(default)]
    pub username: String,

    /// Basic auth password (usually the project secret key).
    #[serde(default)]
    pub secret: String,

    /// Identifiers per API call.
    /// Default: 300
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum batches with a request in flight at once.
    /// Default: 4
    #[serde(default = "default_concurrent_batches")]
    pub concurrent_batches: usize,

    /// Timeout for a single HTTP request (in seconds).
    /// Default: 30
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// 4xx status codes that are retried instead of failing the batch.
    /// Every 5xx status is always retried.
    /// Default: [408, 429]
    #[serde(default = "default_transient_status_codes")]
    pub transient_status_codes: Vec<u16>,

    /// Backoff between attempts of a batch.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ExternalEraserConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            username: String::new(),
            secret: String::new(),
            batch_size: default_batch_size(),
            concurrent_batches: default_concurrent_batches(),
            request_timeout_secs: default_request_timeout_secs(),
            transient_status_codes: default_transient_status_codes(),
            retry: RetryConfig::default(),
        }
    }
}

impl fmt::Debug for ExternalEraserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalEraserConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("batch_size", &self.batch_size)
            .field("concurrent_batches", &self.concurrent_batches)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("transient_status_codes", &self.transient_status_codes)
            .field("retry", &self.retry)
            .finish()
    }
}

fn default_batch_size() -> usize {
    300
}

fn default_concurrent_batches() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_transient_status_codes() -> Vec<u16> {
    vec![408, 429]
}

impl ExternalEraserConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "external.batch_size must be at least 1".into(),
            ));
        }
        if self.concurrent_batches == 0 {
            return Err(ConfigError::Validation(
                "external.concurrent_batches must be at least 1".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "external.request_timeout_secs must be greater than 0".into(),
            ));
        }
        if let Some(endpoint) = &self.endpoint {
            let parsed = url::Url::parse(endpoint).map_err(|e| {
                ConfigError::Validation(format!("external.endpoint '{endpoint}' is invalid: {e}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::Validation(format!(
                    "external.endpoint must use http or https, got '{}'",
                    parsed.scheme()
                )));
            }
        }
        self.retry.validate()
    }

    /// Returns true if a 4xx status should be retried.
    pub fn is_transient_status(&self, status: u16) -> bool {
        self.transient_status_codes.contains(&status)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Retry and backoff settings for external batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per batch, including the first.
    /// Default: 5
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (in milliseconds).
    /// Default: 500
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay (in milliseconds).
    /// Default: 30000
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor applied per retry. Must be greater than 1.0.
    /// Default: 2.0
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of each delay that is randomized (0.0 to 1.0).
    /// Default: 0.2
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "external.retry.max_attempts must be at least 1".into(),
            ));
        }
        // A multiplier of 1.0 leaves no room between successive delays for
        // jitter, so every batch would retry in lockstep
        if self.backoff_multiplier <= 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(ConfigError::Validation(
                "external.retry.backoff_multiplier must be a finite value > 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Validation(
                "external.retry.jitter must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Calculate the delay before retry number `attempt` (0-indexed).
    ///
    /// Jitter only shortens a delay, and never below the previous retry's
    /// un-jittered delay, so successive delays are non-decreasing and never
    /// exceed `max_delay_ms`. Once the previous retry already reached the cap
    /// there is no band left, and the delay is exactly `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        let mut floor = ceiling * (1.0 - self.jitter);
        if attempt > 0 {
            floor = floor.max(self.backoff_ceiling(attempt - 1));
        }

        let delay = if ceiling > floor {
            rand::thread_rng().gen_range(floor..=ceiling)
        } else {
            ceiling
        };

        Duration::from_millis(delay.max(0.0) as u64)
    }

    fn backoff_ceiling(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(exponent);
        base.min(self.max_delay_ms as f64)
    }
}
