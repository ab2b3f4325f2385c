//! Error taxonomy of the stock adjustment engine.
//!
//! Every engine failure carries an [`ErrorKind`]. The intake layer switches on the
//! kind, never on message text, to decide between acknowledging, requeueing and
//! discarding a delivery.

use crate::ledger::{LedgerError, RejectionReason, TransactionId, TransactionState};
use crate::product::{ProductId, ProductStoreError, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed classification of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A line asked for more stock than available. Permanent.
    InsufficientStock,
    /// A line named a product that does not exist. Permanent.
    UnknownProduct,
    /// Optimistic-concurrency retries ran out, or another driver holds the
    /// transaction. Recoverable.
    Conflict,
    /// The transaction has not been applied (yet). Recoverable.
    NotFound,
    /// The transaction is already in a state that forbids the request.
    AlreadyResolved,
    /// A store or the transport could not be reached in time. Recoverable.
    TransportUnavailable,
    /// Stored data contradicts the engine's invariants. Needs an operator.
    InvariantViolation,
}

impl ErrorKind {
    /// Whether retrying the same delivery later can succeed.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::Conflict | Self::NotFound | Self::TransportUnavailable
        )
    }

    /// Whether the failure is a business rejection that no retry will change.
    #[must_use]
    pub const fn is_business_rejection(self) -> bool {
        matches!(self, Self::InsufficientStock | Self::UnknownProduct)
    }

    /// Stable label for logs, metrics and the dead-letter table.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientStock => "insufficient_stock",
            Self::UnknownProduct => "unknown_product",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::AlreadyResolved => "already_resolved",
            Self::TransportUnavailable => "transport_unavailable",
            Self::InvariantViolation => "invariant_violation",
        }
    }

    /// Parse a label produced by [`as_str`](Self::as_str).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::InsufficientStock,
            Self::UnknownProduct,
            Self::Conflict,
            Self::NotFound,
            Self::AlreadyResolved,
            Self::TransportUnavailable,
            Self::InvariantViolation,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of an engine operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StockError {
    /// A line asked for more stock than available.
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product that ran short.
        product_id: ProductId,
        /// Units requested.
        requested: i64,
        /// Units on hand.
        available: i64,
    },

    /// A line named a product that does not exist.
    #[error("Unknown product: {0}")]
    UnknownProduct(ProductId),

    /// The product's version kept moving until the retry budget ran out.
    #[error("Concurrency conflict on product {product_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        /// Contended product.
        product_id: ProductId,
        /// Version last expected.
        expected: Version,
        /// Version found.
        actual: Version,
    },

    /// Another driver holds a live lease on the transaction.
    #[error("Transaction {transaction_id} is in flight until {lease_expires_at}")]
    InFlight {
        /// The transaction.
        transaction_id: TransactionId,
        /// When the other driver's lease runs out.
        lease_expires_at: DateTime<Utc>,
    },

    /// This driver's lease was taken over before it could resolve.
    #[error("Lease on transaction {transaction_id} was lost (held epoch {epoch})")]
    LeaseLost {
        /// The transaction.
        transaction_id: TransactionId,
        /// The epoch this driver held.
        epoch: u64,
    },

    /// Rollback arrived for a transaction that is absent or still pending.
    #[error("Transaction {transaction_id} has not been applied (state: {})", .state.map_or("absent", |s| s.as_str()))]
    TransactionNotApplied {
        /// The transaction.
        transaction_id: TransactionId,
        /// Its state, if a record exists.
        state: Option<TransactionState>,
    },

    /// The ledger refused a transition because the record is already resolved.
    #[error("Transaction {transaction_id} is already {state}")]
    AlreadyResolved {
        /// The transaction.
        transaction_id: TransactionId,
        /// Its current state.
        state: TransactionState,
    },

    /// A store timed out or could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Stored data contradicts an invariant.
    #[error("Invariant violation: {0}")]
    Invariant(String),
}

impl StockError {
    /// Classify the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::UnknownProduct(_) => ErrorKind::UnknownProduct,
            Self::VersionConflict { .. } | Self::InFlight { .. } | Self::LeaseLost { .. } => {
                ErrorKind::Conflict
            }
            Self::TransactionNotApplied { .. } => ErrorKind::NotFound,
            Self::AlreadyResolved { .. } => ErrorKind::AlreadyResolved,
            Self::Unavailable(_) => ErrorKind::TransportUnavailable,
            Self::Invariant(_) => ErrorKind::InvariantViolation,
        }
    }

    /// Whether this is an optimistic-concurrency conflict on a product.
    #[must_use]
    pub const fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Whether this is a store outage worth retrying in place.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// The business rejection this error represents, if any.
    #[must_use]
    pub fn rejection(&self) -> Option<RejectionReason> {
        match self {
            Self::InsufficientStock {
                product_id,
                requested,
                available,
            } => Some(RejectionReason::InsufficientStock {
                product_id: product_id.clone(),
                requested: *requested,
                available: *available,
            }),
            Self::UnknownProduct(product_id) => Some(RejectionReason::UnknownProduct {
                product_id: product_id.clone(),
            }),
            _ => None,
        }
    }
}

impl From<RejectionReason> for StockError {
    fn from(reason: RejectionReason) -> Self {
        match reason {
            RejectionReason::InsufficientStock {
                product_id,
                requested,
                available,
            } => Self::InsufficientStock {
                product_id,
                requested,
                available,
            },
            RejectionReason::UnknownProduct { product_id } => Self::UnknownProduct(product_id),
        }
    }
}

impl From<ProductStoreError> for StockError {
    fn from(err: ProductStoreError) -> Self {
        match err {
            ProductStoreError::Conflict {
                product_id,
                expected,
                actual,
            } => Self::VersionConflict {
                product_id,
                expected,
                actual,
            },
            ProductStoreError::InsufficientStock {
                product_id,
                requested,
                available,
            } => Self::InsufficientStock {
                product_id,
                requested,
                available,
            },
            ProductStoreError::NotFound(product_id) => Self::UnknownProduct(product_id),
            ProductStoreError::Unavailable(reason) => Self::Unavailable(reason),
            ProductStoreError::AlreadyExists(_)
            | ProductStoreError::InvalidAdjustment(_)
            | ProductStoreError::Corrupted(_) => Self::Invariant(err.to_string()),
        }
    }
}

impl From<LedgerError> for StockError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(transaction_id) => Self::TransactionNotApplied {
                transaction_id,
                state: None,
            },
            LedgerError::StaleLease {
                transaction_id,
                held,
                ..
            } => Self::LeaseLost {
                transaction_id,
                epoch: held,
            },
            LedgerError::InvalidTransition {
                transaction_id,
                from,
                ..
            } => Self::AlreadyResolved {
                transaction_id,
                state: from,
            },
            LedgerError::Unavailable(reason) => Self::Unavailable(reason),
            LedgerError::Corrupted(reason) => Self::Invariant(reason),
        }
    }
}
