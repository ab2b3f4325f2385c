//! `PostgreSQL` storage for the stock reconciler.
//!
//! This crate provides durable implementations of the contracts in
//! `stock-reconciler-core`, built on sqlx with runtime-checked queries:
//!
//! - [`PostgresProductStore`]: stock levels and adjustment receipts, with the
//!   conditional update done under a row lock in one transaction
//! - [`PostgresTransactionLedger`]: transaction records with leased ownership
//! - [`DeadLetterQueue`]: durable dead letters with a status lifecycle
//!
//! # Example
//!
//! ```ignore
//! use stock_reconciler_postgres::{PoolConfig, connect, migrate, PostgresProductStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/stock", &PoolConfig::default()).await?;
//!     migrate(&pool).await?;
//!     let products = PostgresProductStore::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use thiserror::Error;

mod dead_letter_queue;
mod ledger;
mod product_store;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedDelivery};
pub use ledger::PostgresTransactionLedger;
pub use product_store::PostgresProductStore;

/// Errors from pool setup, migrations and dead-letter management.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// Could not open the connection pool.
    #[error("Failed to connect: {0}")]
    Connect(String),

    /// A migration failed.
    #[error("Migration failed: {0}")]
    Migrate(String),

    /// A query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored data could not be interpreted.
    #[error("Corrupted row: {0}")]
    Corrupted(String),
}

/// Connection pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`PostgresError::Connect`] if the database cannot be reached.
pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<PgPool, PostgresError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(|e| PostgresError::Connect(e.to_string()))?;

    tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Create or upgrade the schema (products, receipts, ledger, dead letters).
///
/// # Errors
///
/// Returns [`PostgresError::Migrate`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), PostgresError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| PostgresError::Migrate(e.to_string()))?;
    Ok(())
}

/// Convert a stored `BIGINT` to an unsigned counter.
fn to_u64(value: i64, column: &str) -> Result<u64, String> {
    u64::try_from(value).map_err(|_| format!("{column} is negative: {value}"))
}

/// Convert an unsigned counter to a `BIGINT`.
fn to_i64(value: u64, column: &str) -> Result<i64, String> {
    i64::try_from(value).map_err(|_| format!("{column} overflows BIGINT: {value}"))
}
