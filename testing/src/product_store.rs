//! In-memory product store with fault injection.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use stock_reconciler_core::environment::{Clock, SystemClock};
use stock_reconciler_core::product::{
    AdjustDecision, AdjustOutcome, AdjustStock, AdjustmentKind, ProductId, ProductStore,
    ProductStoreError, StockLevel, StockReceipt, Version,
};
use stock_reconciler_core::ledger::TransactionId;

#[derive(Debug)]
struct ProductRow {
    level: StockLevel,
    receipts: Vec<StockReceipt>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    latency: Option<Duration>,
    fail_adjustments_after: Option<usize>,
    adjustments: usize,
    failing_restores: bool,
    interference: HashMap<ProductId, u32>,
}

/// `HashMap`-backed [`ProductStore`] for fast, deterministic tests.
///
/// Every conditional adjustment is decided by [`AdjustStock::evaluate`] under one
/// lock, exactly as a database transaction would.
///
/// # Example
///
/// ```
/// use stock_reconciler_testing::InMemoryProductStore;
/// use stock_reconciler_core::product::{ProductId, ProductStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryProductStore::new();
/// store.insert(ProductId::new("sku-1"), 10).await?;
/// assert_eq!(store.stock(&ProductId::new("sku-1")), Some(10));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryProductStore {
    products: Arc<RwLock<HashMap<ProductId, ProductRow>>>,
    faults: Arc<Mutex<Faults>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryProductStore {
    /// Create an empty store stamping receipts with wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store stamping receipts with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            products: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Mutex::new(Faults::default())),
            clock,
        }
    }

    /// Current stock of a product, bypassing faults.
    #[must_use]
    pub fn stock(&self, product_id: &ProductId) -> Option<i64> {
        self.products
            .read()
            .unwrap()
            .get(product_id)
            .map(|row| row.level.stock)
    }

    /// Receipts of a product for one transaction, bypassing faults.
    #[must_use]
    pub fn receipts_for(&self, product_id: &ProductId, transaction_id: &TransactionId) -> Vec<StockReceipt> {
        self.products
            .read()
            .unwrap()
            .get(product_id)
            .map(|row| {
                row.receipts
                    .iter()
                    .filter(|receipt| &receipt.transaction_id == transaction_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Make every call fail with [`ProductStoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unwrap().unavailable = unavailable;
    }

    /// Delay every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().unwrap().latency = latency;
    }

    /// Let `count` more adjustments succeed, then fail every adjustment with
    /// [`ProductStoreError::Unavailable`] until [`heal`](Self::heal).
    pub fn fail_adjustments_after(&self, count: usize) {
        let mut faults = self.faults.lock().unwrap();
        faults.adjustments = 0;
        faults.fail_adjustments_after = Some(count);
    }

    /// Fail every `Restore` adjustment with [`ProductStoreError::Unavailable`] until
    /// [`heal`](Self::heal).
    pub fn fail_restores(&self, failing: bool) {
        self.faults.lock().unwrap().failing_restores = failing;
    }

    /// Bump the product's version right before each of its next `times`
    /// adjustments, as a concurrent writer would.
    pub fn interfere(&self, product_id: &ProductId, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .interference
            .insert(product_id.clone(), times);
    }

    /// Clear every injected fault.
    pub fn heal(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    async fn before_call(&self) -> Result<(), ProductStoreError> {
        let (unavailable, latency) = {
            let faults = self.faults.lock().unwrap();
            (faults.unavailable, faults.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if unavailable {
            return Err(ProductStoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }

    fn adjust_now(&self, request: &AdjustStock) -> Result<AdjustOutcome, ProductStoreError> {
        let interfere = {
            let mut faults = self.faults.lock().unwrap();
            if faults.failing_restores && request.kind == AdjustmentKind::Restore {
                return Err(ProductStoreError::Unavailable(
                    "injected restore failure".to_string(),
                ));
            }
            if let Some(limit) = faults.fail_adjustments_after {
                if faults.adjustments >= limit {
                    return Err(ProductStoreError::Unavailable(
                        "injected adjustment failure".to_string(),
                    ));
                }
            }
            match faults.interference.get_mut(&request.product_id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        let mut products = self.products.write().unwrap();
        let row = products
            .get_mut(&request.product_id)
            .ok_or_else(|| ProductStoreError::NotFound(request.product_id.clone()))?;

        if interfere {
            row.level.version = row.level.version.next();
        }

        let receipted: Vec<AdjustmentKind> = row
            .receipts
            .iter()
            .filter(|receipt| receipt.transaction_id == request.transaction_id)
            .map(|receipt| receipt.kind)
            .collect();

        let outcome = match request.evaluate(&row.level, &receipted)? {
            AdjustDecision::Apply { stock } => {
                row.level.stock = stock;
                row.level.version = row.level.version.next();
                row.receipts.push(StockReceipt {
                    transaction_id: request.transaction_id.clone(),
                    kind: request.kind,
                    delta: request.delta,
                    version: row.level.version,
                    recorded_at: self.clock.now(),
                });
                AdjustOutcome::Applied(row.level.clone())
            }
            AdjustDecision::AlreadyApplied => AdjustOutcome::AlreadyApplied(row.level.clone()),
            AdjustDecision::Compensated => AdjustOutcome::Compensated(row.level.clone()),
            AdjustDecision::Void => {
                row.receipts.push(StockReceipt {
                    transaction_id: request.transaction_id.clone(),
                    kind: request.kind,
                    delta: 0,
                    version: row.level.version,
                    recorded_at: self.clock.now(),
                });
                AdjustOutcome::Voided(row.level.clone())
            }
        };

        if matches!(outcome, AdjustOutcome::Applied(_)) {
            self.faults.lock().unwrap().adjustments += 1;
        }
        Ok(outcome)
    }
}

impl Default for InMemoryProductStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductStore for InMemoryProductStore {
    fn insert(
        &self,
        product_id: ProductId,
        opening_stock: i64,
    ) -> Pin<Box<dyn Future<Output = Result<StockLevel, ProductStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.before_call().await?;
            if opening_stock < 0 {
                return Err(ProductStoreError::InvalidAdjustment(format!(
                    "opening stock {opening_stock} is negative"
                )));
            }

            let mut products = self.products.write().unwrap();
            if products.contains_key(&product_id) {
                return Err(ProductStoreError::AlreadyExists(product_id));
            }
            let level = StockLevel {
                product_id: product_id.clone(),
                stock: opening_stock,
                version: Version::INITIAL,
            };
            let opening = StockReceipt {
                transaction_id: TransactionId::new(format!("opening:{product_id}")),
                kind: AdjustmentKind::Opening,
                delta: opening_stock,
                version: Version::INITIAL,
                recorded_at: self.clock.now(),
            };
            products.insert(
                product_id,
                ProductRow {
                    level: level.clone(),
                    receipts: vec![opening],
                },
            );
            Ok(level)
        })
    }

    fn load(
        &self,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<StockLevel, ProductStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.before_call().await?;
            self.products
                .read()
                .unwrap()
                .get(&product_id)
                .map(|row| row.level.clone())
                .ok_or(ProductStoreError::NotFound(product_id))
        })
    }

    fn conditional_adjust(
        &self,
        request: AdjustStock,
    ) -> Pin<Box<dyn Future<Output = Result<AdjustOutcome, ProductStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.before_call().await?;
            self.adjust_now(&request)
        })
    }

    fn receipts(
        &self,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StockReceipt>, ProductStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.before_call().await?;
            self.products
                .read()
                .unwrap()
                .get(&product_id)
                .map(|row| row.receipts.clone())
                .ok_or(ProductStoreError::NotFound(product_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reduce(product: &str, tx: &str, delta: i64, expected: Version) -> AdjustStock {
        AdjustStock {
            product_id: ProductId::new(product),
            delta,
            expected_version: expected,
            transaction_id: TransactionId::new(tx),
            kind: AdjustmentKind::Reduce,
        }
    }

    #[tokio::test]
    async fn insert_twice_is_rejected() {
        let store = InMemoryProductStore::new();
        store.insert(ProductId::new("a"), 5).await.unwrap();
        let err = store.insert(ProductId::new("a"), 5).await.unwrap_err();
        assert!(matches!(err, ProductStoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn applied_adjustment_bumps_version_and_writes_receipt() {
        let store = InMemoryProductStore::new();
        let level = store.insert(ProductId::new("a"), 5).await.unwrap();

        let outcome = store
            .conditional_adjust(reduce("a", "tx-1", -2, level.version))
            .await
            .unwrap();
        assert_eq!(outcome.level().stock, 3);
        assert_eq!(outcome.level().version, level.version.next());
        assert_eq!(store.receipts_for(&ProductId::new("a"), &TransactionId::new("tx-1")).len(), 1);
    }

    #[tokio::test]
    async fn replay_is_already_applied_even_with_stale_version() {
        let store = InMemoryProductStore::new();
        let level = store.insert(ProductId::new("a"), 5).await.unwrap();
        store
            .conditional_adjust(reduce("a", "tx-1", -2, level.version))
            .await
            .unwrap();

        let replay = store
            .conditional_adjust(reduce("a", "tx-1", -2, level.version))
            .await
            .unwrap();
        assert!(matches!(replay, AdjustOutcome::AlreadyApplied(_)));
        assert_eq!(store.stock(&ProductId::new("a")), Some(3));
    }

    #[tokio::test]
    async fn interference_forces_a_conflict() {
        let store = InMemoryProductStore::new();
        let level = store.insert(ProductId::new("a"), 5).await.unwrap();
        store.interfere(&ProductId::new("a"), 1);

        let err = store
            .conditional_adjust(reduce("a", "tx-1", -1, level.version))
            .await
            .unwrap_err();
        assert!(matches!(err, ProductStoreError::Conflict { .. }));
        assert_eq!(store.stock(&ProductId::new("a")), Some(5));
    }

    #[tokio::test]
    async fn adjustments_fail_after_the_injected_budget() {
        let store = InMemoryProductStore::new();
        store.insert(ProductId::new("a"), 5).await.unwrap();
        store.fail_adjustments_after(1);

        let level = store.load(ProductId::new("a")).await.unwrap();
        store
            .conditional_adjust(reduce("a", "tx-1", -1, level.version))
            .await
            .unwrap();
        let level = store.load(ProductId::new("a")).await.unwrap();
        let err = store
            .conditional_adjust(reduce("a", "tx-2", -1, level.version))
            .await
            .unwrap_err();
        assert!(matches!(err, ProductStoreError::Unavailable(_)));

        store.heal();
        store
            .conditional_adjust(reduce("a", "tx-2", -1, level.version))
            .await
            .unwrap();
        assert_eq!(store.stock(&ProductId::new("a")), Some(3));
    }
}
