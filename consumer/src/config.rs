//! Configuration management for the stock reconciler service.
//!
//! Loads configuration from environment variables with sensible defaults. Only
//! `DATABASE_URL` is required. Values that are present but unparsable are errors
//! rather than silently replaced by defaults.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use stock_reconciler_postgres::PoolConfig;
use stock_reconciler_runtime::{EngineConfig, IntakeConfig, RetryPolicy, WorkerConfig};
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Environment variable not set: {0}")]
    Missing(&'static str),

    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        /// The variable.
        var: &'static str,
        /// The raw value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Values parse but do not make sense together.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// `PostgreSQL` configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    /// Pool sizing for [`stock_reconciler_postgres::connect`].
    #[must_use]
    pub const fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            acquire_timeout: self.acquire_timeout,
        }
    }
}

/// Redpanda/Kafka configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedpandaConfig {
    /// Broker addresses (comma-separated).
    pub brokers: String,
    /// Topic carrying stock events.
    pub topic: String,
    /// Consumer group shared by all instances.
    pub consumer_group: String,
    /// Topic for messages that will not be retried.
    pub dead_letter_topic: Option<String>,
}

/// Processing limits and timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingConfig {
    /// Deliveries processed at the same time.
    pub concurrency: usize,
    /// Stalled-transaction sweep period; `None` disables the sweep.
    pub recovery_interval: Option<Duration>,
    /// Stalled transactions handled per sweep.
    pub recovery_batch_size: usize,
    /// Retries of one adjustment after version conflicts.
    pub conflict_max_retries: usize,
    /// Retries of one store call after a timeout or outage.
    pub store_max_retries: usize,
    /// Upper bound on one store call.
    pub store_call_timeout: Duration,
    /// How long a worker owns a pending transaction.
    pub lease_ttl: Duration,
    /// Recoverable failures are dead-lettered after this many redeliveries.
    pub max_redeliveries: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            recovery_interval: Some(Duration::from_secs(30)),
            recovery_batch_size: 100,
            conflict_max_retries: 10,
            store_max_retries: 2,
            store_call_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
            max_redeliveries: 20,
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Stores, ledger and dead letters.
    pub database: DatabaseConfig,
    /// Message transport.
    pub redpanda: RedpandaConfig,
    /// Engine, intake and worker settings.
    pub processing: ProcessingConfig,
    /// Where to serve Prometheus metrics; `None` disables the exporter.
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is missing, malformed, or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = ProcessingConfig::default();

        let config = Self {
            database: DatabaseConfig {
                url: env.required("DATABASE_URL")?,
                max_connections: env.parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
                acquire_timeout: Duration::from_secs(
                    env.parse_or("DATABASE_ACQUIRE_TIMEOUT_SECS", 5)?,
                ),
            },
            redpanda: RedpandaConfig {
                brokers: env.string_or("REDPANDA_BROKERS", "localhost:9092"),
                topic: env.string_or("REDPANDA_TOPIC", "stock-events"),
                consumer_group: env.string_or("REDPANDA_CONSUMER_GROUP", "stock-reconciler"),
                dead_letter_topic: env.optional("REDPANDA_DEAD_LETTER_TOPIC"),
            },
            processing: ProcessingConfig {
                concurrency: env.parse_or("WORKER_CONCURRENCY", defaults.concurrency)?,
                // Zero disables the sweep.
                recovery_interval: match env.parse_or("RECOVERY_INTERVAL_SECS", 30_u64)? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                recovery_batch_size: env
                    .parse_or("RECOVERY_BATCH_SIZE", defaults.recovery_batch_size)?,
                conflict_max_retries: env
                    .parse_or("CONFLICT_MAX_RETRIES", defaults.conflict_max_retries)?,
                store_max_retries: env.parse_or("STORE_MAX_RETRIES", defaults.store_max_retries)?,
                store_call_timeout: Duration::from_millis(
                    env.parse_or("STORE_CALL_TIMEOUT_MS", 5_000)?,
                ),
                lease_ttl: Duration::from_secs(env.parse_or("LEASE_TTL_SECS", 30)?),
                max_redeliveries: env.parse_or("MAX_REDELIVERIES", defaults.max_redeliveries)?,
            },
            metrics_addr: env.optional_parse("METRICS_ADDR")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.database.url.trim().is_empty() {
            return fail("DATABASE_URL is empty");
        }
        if self.database.max_connections == 0 {
            return fail("DATABASE_MAX_CONNECTIONS must be at least 1");
        }
        if self.redpanda.brokers.trim().is_empty() {
            return fail("REDPANDA_BROKERS is empty");
        }
        if self.redpanda.topic.trim().is_empty() {
            return fail("REDPANDA_TOPIC is empty");
        }
        if self.redpanda.dead_letter_topic.as_deref() == Some(self.redpanda.topic.as_str()) {
            return fail("REDPANDA_DEAD_LETTER_TOPIC must differ from REDPANDA_TOPIC");
        }

        let processing = &self.processing;
        if processing.concurrency == 0 {
            return fail("WORKER_CONCURRENCY must be at least 1");
        }
        if processing.recovery_batch_size == 0 {
            return fail("RECOVERY_BATCH_SIZE must be at least 1");
        }
        if processing.store_call_timeout.is_zero() {
            return fail("STORE_CALL_TIMEOUT_MS must be positive");
        }
        // A lease shorter than one store call would be taken over mid-call.
        if processing.lease_ttl <= processing.store_call_timeout {
            return fail("LEASE_TTL_SECS must exceed STORE_CALL_TIMEOUT_MS");
        }
        Ok(())
    }

    /// Engine settings, keeping the default backoff shape.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            conflict_retry: RetryPolicy {
                max_retries: self.processing.conflict_max_retries,
                ..defaults.conflict_retry
            },
            store_retry: RetryPolicy {
                max_retries: self.processing.store_max_retries,
                ..defaults.store_retry
            },
            call_timeout: self.processing.store_call_timeout,
            lease_ttl: self.processing.lease_ttl,
        }
    }

    /// Intake settings.
    #[must_use]
    pub fn intake_config(&self) -> IntakeConfig {
        IntakeConfig {
            max_redeliveries: self.processing.max_redeliveries,
            ..IntakeConfig::default()
        }
    }

    /// Worker pool settings.
    #[must_use]
    pub const fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.processing.concurrency,
            recovery_interval: self.processing.recovery_interval,
            recovery_batch_size: self.processing.recovery_batch_size,
        }
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn optional(&self, var: &'static str) -> Option<String> {
        (self.0)(var)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn string_or(&self, var: &'static str, default: &str) -> String {
        self.optional(var).unwrap_or_else(|| default.to_string())
    }

    fn optional_parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(var)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn parse_or<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional_parse(var)?.unwrap_or(default))
    }
}
