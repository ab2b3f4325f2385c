//! Product identity, stock levels and the Product Store contract.
//!
//! A product's stock is a non-negative integer guarded by a [`Version`] token. Every
//! mutation goes through [`ProductStore::conditional_adjust`], which applies a signed
//! delta only if the caller's expected version still matches and the result stays
//! non-negative.
//!
//! Each applied adjustment leaves a [`StockReceipt`] keyed by
//! `(product, transaction, kind)`. Receipts make adjustments replay-safe: applying the
//! same keyed adjustment twice reports [`AdjustOutcome::AlreadyApplied`] instead of
//! moving stock again, and the stored stock always equals the sum of its receipts'
//! deltas.
//!
//! # Implementations
//!
//! - `PostgresProductStore` (in `stock-reconciler-postgres`): production storage
//! - `InMemoryProductStore` (in `stock-reconciler-testing`): fast, deterministic tests

use crate::ledger::TransactionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `ProductId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid product ID: {0}")]
pub struct ParseProductIdError(String);

/// Unique identifier of a product.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings (use for external input)
/// - `From::from()` and `new()`: no validation (for trusted input)
///
/// # Examples
///
/// ```
/// use stock_reconciler_core::product::ProductId;
///
/// let id = ProductId::new("sku-1001");
/// assert_eq!(id.as_str(), "sku-1001");
///
/// assert!("".parse::<ProductId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Create a new `ProductId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the product ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `ProductId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProductId {
    type Err = ParseProductIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseProductIdError(
                "Product ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for ProductId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ProductId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Version token for optimistic concurrency on a product's stock.
///
/// A freshly registered product starts at [`Version::INITIAL`]; every stock mutation
/// advances it by exactly one. Receipt-only writes (void tombstones) leave it alone.
///
/// # Examples
///
/// ```
/// use stock_reconciler_core::product::Version;
///
/// let v0 = Version::INITIAL;
/// assert_eq!(v0.next(), Version::new(1));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version of a freshly registered product.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Current stock of one product together with its version token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    /// The product this level belongs to.
    pub product_id: ProductId,
    /// Units on hand. Never negative in a committed state.
    pub stock: i64,
    /// Concurrency token.
    pub version: Version,
}

/// What a keyed adjustment is for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    /// Stock a product was registered with.
    Opening,
    /// Decrement applied for a placed order.
    Reduce,
    /// Compensating increment reversing a `Reduce` of the same transaction.
    Restore,
    /// Keyed replenishment.
    Restock,
}

impl AdjustmentKind {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Reduce => "reduce",
            Self::Restore => "restore",
            Self::Restock => "restock",
        }
    }

    /// Parse from the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`ProductStoreError::Corrupted`] for an unknown tag.
    pub fn parse(s: &str) -> Result<Self, ProductStoreError> {
        match s {
            "opening" => Ok(Self::Opening),
            "reduce" => Ok(Self::Reduce),
            "restore" => Ok(Self::Restore),
            "restock" => Ok(Self::Restock),
            _ => Err(ProductStoreError::Corrupted(format!(
                "Invalid adjustment kind: {s}"
            ))),
        }
    }

    /// Whether a delta of this sign is allowed for the kind.
    const fn accepts(self, delta: i64) -> bool {
        match self {
            Self::Opening => delta >= 0,
            Self::Reduce => delta < 0,
            Self::Restore | Self::Restock => delta > 0,
        }
    }
}

impl fmt::Display for AdjustmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one applied (or voided) keyed adjustment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceipt {
    /// Idempotency key of the adjustment.
    pub transaction_id: TransactionId,
    /// What the adjustment was for.
    pub kind: AdjustmentKind,
    /// Signed change applied to stock; zero for a void tombstone.
    pub delta: i64,
    /// Product version after the adjustment.
    pub version: Version,
    /// When the receipt was written.
    pub recorded_at: DateTime<Utc>,
}

/// A conditional, keyed stock adjustment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdjustStock {
    /// Product to adjust.
    pub product_id: ProductId,
    /// Signed change to apply.
    pub delta: i64,
    /// Version the caller read before deciding on the delta.
    pub expected_version: Version,
    /// Idempotency key.
    pub transaction_id: TransactionId,
    /// Purpose of the adjustment.
    pub kind: AdjustmentKind,
}

/// What a store should do with an [`AdjustStock`] request, given the current level
/// and the kinds already receipted for the same transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjustDecision {
    /// Write the new stock, bump the version and append a receipt.
    Apply {
        /// Stock after the adjustment.
        stock: i64,
    },
    /// The same keyed adjustment is already receipted.
    AlreadyApplied,
    /// A `Reduce` arrived after its transaction was already restored or voided.
    Compensated,
    /// A `Restore` arrived with nothing to restore: write a zero-delta receipt only.
    Void,
}

impl AdjustStock {
    /// Decide the effect of this request.
    ///
    /// Receipts are consulted before the version, so a replay after a successful
    /// write reports `AlreadyApplied` rather than a conflict.
    ///
    /// # Errors
    ///
    /// - [`ProductStoreError::InvalidAdjustment`] if the delta's sign does not fit the kind
    /// - [`ProductStoreError::Conflict`] if `expected_version` is stale
    /// - [`ProductStoreError::InsufficientStock`] if the result would be negative
    pub fn evaluate(
        &self,
        current: &StockLevel,
        receipted: &[AdjustmentKind],
    ) -> Result<AdjustDecision, ProductStoreError> {
        if !self.kind.accepts(self.delta) {
            return Err(ProductStoreError::InvalidAdjustment(format!(
                "{} adjustment cannot carry delta {}",
                self.kind, self.delta
            )));
        }

        let has = |kind: AdjustmentKind| receipted.contains(&kind);
        match self.kind {
            AdjustmentKind::Reduce if has(AdjustmentKind::Restore) => {
                return Ok(AdjustDecision::Compensated);
            }
            AdjustmentKind::Restore if !has(AdjustmentKind::Restore) && !has(AdjustmentKind::Reduce) => {
                return Ok(AdjustDecision::Void);
            }
            kind if has(kind) => return Ok(AdjustDecision::AlreadyApplied),
            _ => {}
        }

        if current.version != self.expected_version {
            return Err(ProductStoreError::Conflict {
                product_id: self.product_id.clone(),
                expected: self.expected_version,
                actual: current.version,
            });
        }

        let stock = current.stock.checked_add(self.delta).ok_or_else(|| {
            ProductStoreError::InvalidAdjustment(format!(
                "stock {} overflows when adjusted by {}",
                current.stock, self.delta
            ))
        })?;
        if stock < 0 {
            return Err(ProductStoreError::InsufficientStock {
                product_id: self.product_id.clone(),
                requested: self.delta.saturating_neg(),
                available: current.stock,
            });
        }

        Ok(AdjustDecision::Apply { stock })
    }
}

/// Result of a successful [`ProductStore::conditional_adjust`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// Stock moved; carries the new level.
    Applied(StockLevel),
    /// Replay of an adjustment that is already receipted; nothing moved.
    AlreadyApplied(StockLevel),
    /// `Reduce` for a transaction that was already compensated; nothing moved.
    Compensated(StockLevel),
    /// `Restore` with no prior `Reduce`; a zero-delta receipt was written.
    Voided(StockLevel),
}

impl AdjustOutcome {
    /// The level after the call.
    #[must_use]
    pub const fn level(&self) -> &StockLevel {
        match self {
            Self::Applied(level)
            | Self::AlreadyApplied(level)
            | Self::Compensated(level)
            | Self::Voided(level) => level,
        }
    }
}

/// Errors from Product Store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProductStoreError {
    /// The version moved since the caller read it. Retry with a fresh read.
    #[error("Concurrency conflict on product {product_id}: expected version {expected}, found {actual}")]
    Conflict {
        /// Product the conflict occurred on.
        product_id: ProductId,
        /// Version the caller expected.
        expected: Version,
        /// Version currently stored.
        actual: Version,
    },

    /// Applying the delta would drive stock negative.
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product that ran short.
        product_id: ProductId,
        /// Units requested.
        requested: i64,
        /// Units on hand.
        available: i64,
    },

    /// No product with this ID exists.
    #[error("Product not found: {0}")]
    NotFound(ProductId),

    /// A product with this ID already exists.
    #[error("Product already exists: {0}")]
    AlreadyExists(ProductId),

    /// The request itself is malformed (delta sign, overflow).
    #[error("Invalid adjustment: {0}")]
    InvalidAdjustment(String),

    /// Stored data could not be interpreted.
    #[error("Corrupted product data: {0}")]
    Corrupted(String),

    /// The store could not be reached or timed out.
    #[error("Product store unavailable: {0}")]
    Unavailable(String),
}

/// Durable product stock storage with conditional updates.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine shares one store across all
/// workers.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the store can be used as
/// `Arc<dyn ProductStore>`.
pub trait ProductStore: Send + Sync {
    /// Register a product with an opening stock.
    ///
    /// # Errors
    ///
    /// - [`ProductStoreError::AlreadyExists`] if the ID is taken
    /// - [`ProductStoreError::InvalidAdjustment`] if `opening_stock` is negative
    /// - [`ProductStoreError::Unavailable`] on storage failure
    fn insert(
        &self,
        product_id: ProductId,
        opening_stock: i64,
    ) -> Pin<Box<dyn Future<Output = Result<StockLevel, ProductStoreError>> + Send + '_>>;

    /// Read a product's current stock and version.
    ///
    /// # Errors
    ///
    /// - [`ProductStoreError::NotFound`] if the product does not exist
    /// - [`ProductStoreError::Unavailable`] on storage failure
    fn load(
        &self,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<StockLevel, ProductStoreError>> + Send + '_>>;

    /// Atomically apply a keyed adjustment if the version still matches.
    ///
    /// Implementations must decide with [`AdjustStock::evaluate`] against the
    /// product's current level and the receipts already recorded for
    /// `(product_id, transaction_id)`, and persist the new level and receipt in one
    /// atomic step.
    ///
    /// # Errors
    ///
    /// See [`AdjustStock::evaluate`], plus [`ProductStoreError::NotFound`] and
    /// [`ProductStoreError::Unavailable`].
    fn conditional_adjust(
        &self,
        request: AdjustStock,
    ) -> Pin<Box<dyn Future<Output = Result<AdjustOutcome, ProductStoreError>> + Send + '_>>;

    /// All receipts of a product, oldest first.
    ///
    /// # Errors
    ///
    /// - [`ProductStoreError::NotFound`] if the product does not exist
    /// - [`ProductStoreError::Unavailable`] on storage failure
    fn receipts(
        &self,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StockReceipt>, ProductStoreError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(stock: i64, version: u64) -> StockLevel {
        StockLevel {
            product_id: ProductId::new("sku-1"),
            stock,
            version: Version::new(version),
        }
    }

    fn request(delta: i64, expected: u64, kind: AdjustmentKind) -> AdjustStock {
        AdjustStock {
            product_id: ProductId::new("sku-1"),
            delta,
            expected_version: Version::new(expected),
            transaction_id: TransactionId::new("tx-1"),
            kind,
        }
    }

    #[test]
    fn parse_product_id_rejects_blank() {
        assert!("".parse::<ProductId>().is_err());
        assert!("   ".parse::<ProductId>().is_err());
        assert_eq!("sku-9".parse::<ProductId>(), Ok(ProductId::new("sku-9")));
    }

    #[test]
    fn reduce_applies_when_version_matches() {
        let decision = request(-3, 2, AdjustmentKind::Reduce).evaluate(&level(10, 2), &[]);
        assert_eq!(decision, Ok(AdjustDecision::Apply { stock: 7 }));
    }

    #[test]
    fn reduce_to_exactly_zero_is_allowed() {
        let decision = request(-10, 0, AdjustmentKind::Reduce).evaluate(&level(10, 0), &[]);
        assert_eq!(decision, Ok(AdjustDecision::Apply { stock: 0 }));
    }

    #[test]
    fn stale_version_is_a_conflict() {
        let decision = request(-1, 1, AdjustmentKind::Reduce).evaluate(&level(10, 2), &[]);
        assert!(matches!(
            decision,
            Err(ProductStoreError::Conflict { expected, actual, .. })
                if expected == Version::new(1) && actual == Version::new(2)
        ));
    }

    #[test]
    fn negative_result_is_insufficient_stock() {
        let decision = request(-11, 0, AdjustmentKind::Reduce).evaluate(&level(10, 0), &[]);
        assert!(matches!(
            decision,
            Err(ProductStoreError::InsufficientStock { requested: 11, available: 10, .. })
        ));
    }

    #[test]
    fn receipts_win_over_stale_version() {
        let decision = request(-1, 0, AdjustmentKind::Reduce)
            .evaluate(&level(9, 1), &[AdjustmentKind::Reduce]);
        assert_eq!(decision, Ok(AdjustDecision::AlreadyApplied));
    }

    #[test]
    fn reduce_after_restore_is_compensated() {
        let decision = request(-1, 3, AdjustmentKind::Reduce)
            .evaluate(&level(10, 3), &[AdjustmentKind::Restore]);
        assert_eq!(decision, Ok(AdjustDecision::Compensated));
    }

    #[test]
    fn restore_without_reduce_is_void() {
        let decision = request(4, 0, AdjustmentKind::Restore).evaluate(&level(10, 5), &[]);
        assert_eq!(decision, Ok(AdjustDecision::Void));
    }

    #[test]
    fn restore_twice_is_already_applied() {
        let decision = request(4, 0, AdjustmentKind::Restore).evaluate(
            &level(10, 5),
            &[AdjustmentKind::Reduce, AdjustmentKind::Restore],
        );
        assert_eq!(decision, Ok(AdjustDecision::AlreadyApplied));
    }

    #[test]
    fn delta_sign_must_fit_kind() {
        assert!(matches!(
            request(3, 0, AdjustmentKind::Reduce).evaluate(&level(10, 0), &[]),
            Err(ProductStoreError::InvalidAdjustment(_))
        ));
        assert!(matches!(
            request(-3, 0, AdjustmentKind::Restock).evaluate(&level(10, 0), &[]),
            Err(ProductStoreError::InvalidAdjustment(_))
        ));
    }

    #[test]
    fn adjustment_kind_roundtrip() {
        for kind in [
            AdjustmentKind::Opening,
            AdjustmentKind::Reduce,
            AdjustmentKind::Restore,
            AdjustmentKind::Restock,
        ] {
            assert_eq!(AdjustmentKind::parse(kind.as_str()), Ok(kind));
        }
        assert!(AdjustmentKind::parse("bogus").is_err());
    }
}
