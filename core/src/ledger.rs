//! Transaction ledger: durable records of what each external transaction did to stock.
//!
//! The ledger is the source of truth for idempotency and compensation. A record is
//! created `Pending` before any stock moves and resolved afterwards:
//!
//! ```text
//! Pending ──► Applied ──► RolledBack
//!    │
//!    └──────► Rejected
//! ```
//!
//! `Pending` records are owned by one driver at a time through a [`Lease`]. A lease
//! carries an epoch; claiming an expired lease bumps the epoch, and resolving requires
//! the caller's epoch to still be current. A driver that lost its lease therefore
//! cannot resolve a record that someone else is now driving.

use crate::product::ProductId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `TransactionId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transaction ID: {0}")]
pub struct ParseTransactionIdError(String);

/// Externally supplied idempotency key of a stock transaction.
///
/// # Examples
///
/// ```
/// use stock_reconciler_core::ledger::TransactionId;
///
/// let id: TransactionId = "order-7731".parse().unwrap();
/// assert_eq!(id.as_str(), "order-7731");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Create a new `TransactionId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the transaction ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `TransactionId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ParseTransactionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseTransactionIdError(
                "Transaction ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TransactionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One `(product, quantity)` line of a transaction. Quantity is always at least 1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLine {
    /// Product the line adjusts.
    pub product_id: ProductId,
    /// Units reduced (and later restored).
    pub quantity: u32,
}

impl LedgerLine {
    /// Create a line.
    #[must_use]
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// Lifecycle state of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Decrements are in progress (or were interrupted).
    Pending,
    /// Every line was decremented.
    Applied,
    /// Every line was restored after being applied.
    RolledBack,
    /// The reduce was refused; any partial decrements are compensated.
    Rejected,
}

impl TransactionState {
    /// Convert state to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
        }
    }

    /// Parse state from database string.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Corrupted`] if the string doesn't match a known state.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "rolled_back" => Ok(Self::RolledBack),
            "rejected" => Ok(Self::Rejected),
            _ => Err(LedgerError::Corrupted(format!(
                "Invalid transaction state: {s}"
            ))),
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Applied | Self::Rejected) | (Self::Applied, Self::RolledBack)
        )
    }

    /// `true` for every state except `Pending`.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a reduce was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    /// A line asked for more than the product had.
    InsufficientStock {
        /// Product that ran short.
        product_id: ProductId,
        /// Units requested.
        requested: i64,
        /// Units on hand when the line was attempted.
        available: i64,
    },
    /// A line named a product that does not exist.
    UnknownProduct {
        /// The missing product.
        product_id: ProductId,
    },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientStock {
                product_id,
                requested,
                available,
            } => write!(
                f,
                "insufficient stock for product {product_id}: requested {requested}, available {available}"
            ),
            Self::UnknownProduct { product_id } => write!(f, "unknown product {product_id}"),
        }
    }
}

/// Time-bounded, epoch-fenced ownership of a `Pending` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Increments every time the record is claimed.
    pub epoch: u64,
    /// After this instant another driver may claim the record.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease still excludes other drivers at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A transaction's durable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Idempotency key.
    pub transaction_id: TransactionId,
    /// Lines as recorded when the transaction was first seen.
    pub lines: Vec<LedgerLine>,
    /// Lifecycle state.
    pub state: TransactionState,
    /// Current lease (meaningful while `Pending`).
    pub lease: Lease,
    /// Set when `state` is `Rejected`.
    pub rejection: Option<RejectionReason>,
    /// Restores are owed for this record and not yet all recorded: set when a reduce
    /// is rejected or a rollback starts, cleared once every line is restored.
    #[serde(default)]
    pub compensating: bool,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed state.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    /// Decide what `begin` does with this existing record.
    #[must_use]
    pub fn begin_decision(&self, now: DateTime<Utc>) -> BeginDecision {
        if self.state.is_resolved() {
            BeginDecision::Resolved
        } else if self.lease.is_live(now) {
            BeginDecision::InFlight
        } else {
            BeginDecision::Claim {
                epoch: self.lease.epoch + 1,
            }
        }
    }

    /// Whether a recovery sweep should pick this record up at `now`: a `Pending`
    /// record or one still owed restores, whose lease has run out.
    #[must_use]
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        (self.state == TransactionState::Pending || self.compensating) && !self.lease.is_live(now)
    }

    /// Check whether this record may move to `target` on behalf of a driver holding
    /// `epoch` (`None` for transitions out of a resolved state, which are not leased).
    ///
    /// Returns `Ok(true)` if the write should happen, `Ok(false)` if the record is
    /// already in `target` (idempotent replay).
    ///
    /// # Errors
    ///
    /// - [`LedgerError::StaleLease`] if a `Pending` record is now held under another epoch
    /// - [`LedgerError::InvalidTransition`] if the lifecycle forbids the move
    pub fn check_transition(
        &self,
        target: TransactionState,
        epoch: Option<u64>,
    ) -> Result<bool, LedgerError> {
        if self.state == target {
            return Ok(false);
        }
        if !self.state.can_transition_to(target) {
            return Err(LedgerError::InvalidTransition {
                transaction_id: self.transaction_id.clone(),
                from: self.state,
                to: target,
            });
        }
        if let Some(epoch) = epoch {
            if self.state == TransactionState::Pending && self.lease.epoch != epoch {
                return Err(LedgerError::StaleLease {
                    transaction_id: self.transaction_id.clone(),
                    held: epoch,
                    current: self.lease.epoch,
                });
            }
        }
        Ok(true)
    }
}

/// What `begin` should do with an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginDecision {
    /// The record is resolved; report it.
    Resolved,
    /// Another driver holds a live lease.
    InFlight,
    /// The lease expired; take it over under the given epoch.
    Claim {
        /// The new epoch.
        epoch: u64,
    },
}

/// Request to create or claim a transaction record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginTransaction {
    /// Idempotency key.
    pub transaction_id: TransactionId,
    /// Lines to record if the transaction is new.
    pub lines: Vec<LedgerLine>,
    /// Current time.
    pub now: DateTime<Utc>,
    /// Lease expiry for the caller.
    pub lease_until: DateTime<Utc>,
}

impl BeginTransaction {
    /// The record a brand new transaction starts with.
    #[must_use]
    pub fn new_record(&self) -> TransactionRecord {
        TransactionRecord {
            transaction_id: self.transaction_id.clone(),
            lines: self.lines.clone(),
            state: TransactionState::Pending,
            lease: Lease {
                epoch: 1,
                expires_at: self.lease_until,
            },
            rejection: None,
            compensating: false,
            created_at: self.now,
            resolved_at: None,
        }
    }
}

/// Result of [`TransactionLedger::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The transaction is new; the caller drives it under epoch 1.
    Started(TransactionRecord),
    /// An expired lease was taken over; the caller drives the recorded lines.
    Resumed(TransactionRecord),
    /// Another driver holds a live lease.
    InFlight {
        /// When that lease runs out.
        lease_expires_at: DateTime<Utc>,
    },
    /// The transaction was already resolved.
    Resolved(TransactionRecord),
}

/// Terminal resolution of a `Pending` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every line was decremented.
    Applied,
    /// The reduce was refused.
    Rejected(RejectionReason),
}

impl Resolution {
    /// State the record ends up in.
    #[must_use]
    pub const fn state(&self) -> TransactionState {
        match self {
            Self::Applied => TransactionState::Applied,
            Self::Rejected(_) => TransactionState::Rejected,
        }
    }
}

/// Errors from ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No record exists for the transaction.
    #[error("Transaction not found: {0}")]
    NotFound(TransactionId),

    /// The caller's lease epoch is no longer current.
    #[error("Stale lease on transaction {transaction_id}: held epoch {held}, current epoch {current}")]
    StaleLease {
        /// The transaction.
        transaction_id: TransactionId,
        /// Epoch the caller holds.
        held: u64,
        /// Epoch now recorded.
        current: u64,
    },

    /// The lifecycle forbids the requested move.
    #[error("Invalid transition for transaction {transaction_id}: {from} -> {to}")]
    InvalidTransition {
        /// The transaction.
        transaction_id: TransactionId,
        /// Current state.
        from: TransactionState,
        /// Requested state.
        to: TransactionState,
    },

    /// Stored data could not be interpreted.
    #[error("Corrupted ledger data: {0}")]
    Corrupted(String),

    /// The ledger could not be reached or timed out.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Durable transaction ledger.
///
/// Every operation is safe to re-invoke: repeating a completed transition returns the
/// record unchanged.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the ledger can be used as
/// `Arc<dyn TransactionLedger>`.
pub trait TransactionLedger: Send + Sync {
    /// Read a record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] on storage failure.
    fn get(
        &self,
        transaction_id: TransactionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TransactionRecord>, LedgerError>> + Send + '_>>;

    /// Create a `Pending` record, or claim an existing one whose lease expired.
    ///
    /// Decides with [`TransactionRecord::begin_decision`]. Creation and claiming must
    /// be atomic: of two concurrent callers, at most one gets `Started`/`Resumed`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] on storage failure.
    fn begin(
        &self,
        request: BeginTransaction,
    ) -> Pin<Box<dyn Future<Output = Result<BeginOutcome, LedgerError>> + Send + '_>>;

    /// Resolve a `Pending` record held under `epoch`.
    ///
    /// A `Rejected` resolution also sets [`TransactionRecord::compensating`].
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] if there is no record
    /// - [`LedgerError::StaleLease`] if `epoch` is no longer current
    /// - [`LedgerError::InvalidTransition`] if the record is already resolved differently
    /// - [`LedgerError::Unavailable`] on storage failure
    fn resolve(
        &self,
        transaction_id: TransactionId,
        epoch: u64,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>>;

    /// Give up a lease early so the next delivery can claim the record at once.
    ///
    /// Sets the lease expiry to `now` if the record is `Pending` under `epoch`; does
    /// nothing otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] on storage failure.
    fn release_lease(
        &self,
        transaction_id: TransactionId,
        epoch: u64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>>;

    /// Flag an `Applied` record as owing restores and lease it until `lease_until`,
    /// so a rollback that stops halfway is finished by a recovery sweep.
    ///
    /// Returns the record unchanged unless it is `Applied`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] if there is no record
    /// - [`LedgerError::Unavailable`] on storage failure
    fn begin_rollback(
        &self,
        transaction_id: TransactionId,
        lease_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>>;

    /// Clear [`TransactionRecord::compensating`] on a `Rejected` record once every
    /// line has been restored. Does nothing to records in any other state.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] if there is no record
    /// - [`LedgerError::Unavailable`] on storage failure
    fn settle_compensation(
        &self,
        transaction_id: TransactionId,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>>;

    /// Move an `Applied` record to `RolledBack`, clearing
    /// [`TransactionRecord::compensating`].
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] if there is no record
    /// - [`LedgerError::InvalidTransition`] unless the record is `Applied` or `RolledBack`
    /// - [`LedgerError::Unavailable`] on storage failure
    fn mark_rolled_back(
        &self,
        transaction_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>>;

    /// Records that are [stalled](TransactionRecord::is_stalled) at `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] on storage failure.
    fn list_stalled(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<TransactionRecord>, LedgerError>> + Send + '_>>;
}
