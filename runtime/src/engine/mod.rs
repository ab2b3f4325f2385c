//! The stock adjustment engine.
//!
//! [`StockEngine`] turns decoded commands into durable, idempotent stock changes:
//!
//! - a reduce is recorded in the [`TransactionLedger`] before any stock moves, then
//!   drives one keyed `Reduce` adjustment per line under the record's lease
//! - a business rejection resolves the record `Rejected` and compensates every line
//!   with keyed `Restore` adjustments, so the reduce is all-or-nothing
//! - a rollback restores the lines of an `Applied` record and marks it `RolledBack`
//!
//! Every store call is bounded by a timeout and retried on transient failure; every
//! adjustment is retried on version conflict with a fresh read. Because adjustments
//! are keyed by transaction id, any step can be repeated after a crash or a
//! redelivery without moving stock twice.

mod audit;
mod recovery;
mod reduce;
mod rollback;

pub use audit::StockAudit;
pub use recovery::RecoveryReport;

use crate::metrics::EngineMetrics;
use crate::retry::{RetryError, RetryPolicy, retry_with_predicate};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stock_reconciler_core::command::StockCommand;
use stock_reconciler_core::environment::Clock;
use stock_reconciler_core::error::StockError;
use stock_reconciler_core::ledger::{TransactionId, TransactionLedger, TransactionRecord, TransactionState};
use stock_reconciler_core::product::{
    AdjustOutcome, AdjustStock, AdjustmentKind, ProductId, ProductStore, StockLevel,
};

/// Tuning knobs of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retries of a single adjustment after a version conflict.
    pub conflict_retry: RetryPolicy,
    /// Retries of a single store call after a timeout or outage.
    pub store_retry: RetryPolicy,
    /// Upper bound on one store call.
    pub call_timeout: Duration,
    /// How long a driver owns a pending transaction before others may take over.
    pub lease_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conflict_retry: RetryPolicy::builder()
                .max_retries(10)
                .initial_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(200))
                .build(),
            store_retry: RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(50))
                .max_delay(Duration::from_millis(500))
                .build(),
            call_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// Successful result of an engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Every line of the reduce was applied.
    Applied {
        /// The transaction.
        transaction_id: TransactionId,
    },
    /// Every line of an applied transaction was restored.
    RolledBack {
        /// The transaction.
        transaction_id: TransactionId,
    },
    /// The command had already taken effect; nothing changed.
    Duplicate {
        /// The transaction.
        transaction_id: TransactionId,
        /// State the transaction was found in.
        state: TransactionState,
    },
    /// A keyed restock was applied (or had been applied before).
    Restocked {
        /// Level after the restock.
        level: StockLevel,
        /// Whether this call was a replay of an earlier restock.
        replayed: bool,
    },
}

impl EngineOutcome {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::RolledBack { .. } => "rolled_back",
            Self::Duplicate { .. } => "duplicate",
            Self::Restocked { .. } => "restocked",
        }
    }
}

/// Applies reduce, rollback and restock commands against a product store and a
/// transaction ledger.
///
/// Cheap to share: wrap it in an `Arc` and hand it to every worker.
pub struct StockEngine {
    products: Arc<dyn ProductStore>,
    ledger: Arc<dyn TransactionLedger>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl StockEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        products: Arc<dyn ProductStore>,
        ledger: Arc<dyn TransactionLedger>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            products,
            ledger,
            clock,
            config,
        }
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a decoded command.
    ///
    /// # Errors
    ///
    /// See [`reduce`](Self::reduce) and [`rollback`](Self::rollback).
    pub async fn execute(&self, command: StockCommand) -> Result<EngineOutcome, StockError> {
        let name = command.event_name();
        let started = Instant::now();
        let result = match command {
            StockCommand::Reduce(reduce) => self.reduce(reduce).await,
            StockCommand::Rollback(rollback) => self.rollback(rollback).await,
        };
        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(err) => err.kind().as_str(),
        };
        EngineMetrics::record_command(name, outcome, started.elapsed());
        result
    }

    /// Register a product with an opening stock.
    ///
    /// # Errors
    ///
    /// - [`StockError::Invariant`] if the product already exists
    /// - [`StockError::Unavailable`] if the store cannot be reached
    pub async fn register_product(
        &self,
        product_id: ProductId,
        opening_stock: u32,
    ) -> Result<StockLevel, StockError> {
        let level = self
            .call("products.insert", || {
                self.products.insert(product_id.clone(), i64::from(opening_stock))
            })
            .await?;
        tracing::info!(product_id = %product_id, stock = level.stock, "Product registered");
        Ok(level)
    }

    /// Current stock of a product.
    ///
    /// # Errors
    ///
    /// - [`StockError::UnknownProduct`] if the product does not exist
    /// - [`StockError::Unavailable`] if the store cannot be reached
    pub async fn stock_level(&self, product_id: &ProductId) -> Result<StockLevel, StockError> {
        self.call("products.load", || self.products.load(product_id.clone()))
            .await
    }

    /// The ledger record of a transaction, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Unavailable`] if the ledger cannot be reached.
    pub async fn transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<TransactionRecord>, StockError> {
        self.call("ledger.get", || self.ledger.get(transaction_id.clone()))
            .await
    }

    /// Add stock to a product, keyed by `restock_id` so a repeated request adds once.
    ///
    /// # Errors
    ///
    /// - [`StockError::UnknownProduct`] if the product does not exist
    /// - [`StockError::VersionConflict`] if conflict retries ran out
    /// - [`StockError::Unavailable`] if the store cannot be reached
    #[tracing::instrument(skip_all, fields(restock_id = %restock_id, product_id = %product_id, quantity = quantity.get()))]
    pub async fn restock(
        &self,
        restock_id: TransactionId,
        product_id: ProductId,
        quantity: NonZeroU32,
    ) -> Result<EngineOutcome, StockError> {
        let started = Instant::now();
        let delta = i64::from(quantity.get());
        let result = match self
            .adjust(&product_id, &restock_id, AdjustmentKind::Restock, delta)
            .await
        {
            Ok(AdjustOutcome::Applied(level)) => {
                tracing::info!(stock = level.stock, "Product restocked");
                Ok(EngineOutcome::Restocked {
                    level,
                    replayed: false,
                })
            }
            Ok(AdjustOutcome::AlreadyApplied(level)) => {
                tracing::debug!("Restock already applied");
                Ok(EngineOutcome::Restocked {
                    level,
                    replayed: true,
                })
            }
            Ok(other) => Err(StockError::Invariant(format!(
                "restock {restock_id} produced unexpected outcome {other:?}"
            ))),
            Err(err) => Err(err),
        };
        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(err) => err.kind().as_str(),
        };
        EngineMetrics::record_command("restock", outcome, started.elapsed());
        result
    }

    /// One keyed adjustment, re-read and retried while the version keeps moving.
    async fn adjust(
        &self,
        product_id: &ProductId,
        transaction_id: &TransactionId,
        kind: AdjustmentKind,
        delta: i64,
    ) -> Result<AdjustOutcome, StockError> {
        let attempt = move || async move {
            let level = self
                .call("products.load", || self.products.load(product_id.clone()))
                .await?;
            let request = AdjustStock {
                product_id: product_id.clone(),
                delta,
                expected_version: level.version,
                transaction_id: transaction_id.clone(),
                kind,
            };
            self.call("products.conditional_adjust", || {
                self.products.conditional_adjust(request.clone())
            })
            .await
        };

        match retry_with_predicate(
            &self.config.conflict_retry,
            attempt,
            StockError::is_version_conflict,
        )
        .await
        {
            Ok(outcome) => Ok(outcome),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                EngineMetrics::record_conflicts_exhausted();
                tracing::warn!(
                    product_id = %product_id,
                    transaction_id = %transaction_id,
                    kind = %kind,
                    attempts,
                    "Gave up on contended product"
                );
                Err(last_error)
            }
            Err(RetryError::Aborted(err)) => Err(err),
        }
    }

    /// One store call, bounded by the call timeout and retried while unavailable.
    async fn call<T, E, F, Fut>(&self, operation: &'static str, mut make: F) -> Result<T, StockError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<StockError>,
    {
        let timeout = self.config.call_timeout;
        retry_with_predicate(
            &self.config.store_retry,
            || {
                let attempt = make();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(result) => result.map_err(Into::into),
                        Err(_) => Err(StockError::Unavailable(format!(
                            "{operation} timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    }
                }
            },
            StockError::is_unavailable,
        )
        .await
        .map_err(RetryError::into_inner)
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.lease_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(now)
    }
}
