//! `PostgreSQL` product store.
//!
//! A conditional adjustment runs in one database transaction:
//!
//! 1. `SELECT ... FOR UPDATE` on the product row
//! 2. read the kinds already receipted for `(product, transaction)`
//! 3. decide with [`AdjustStock::evaluate`]
//! 4. update the row and append the receipt, then commit
//!
//! The row lock only lasts for the statement pair; concurrency between callers is
//! still governed by the version each of them read beforehand.

use crate::{to_i64, to_u64};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use stock_reconciler_core::ledger::TransactionId;
use stock_reconciler_core::product::{
    AdjustDecision, AdjustOutcome, AdjustStock, AdjustmentKind, ProductId, ProductStore,
    ProductStoreError, StockLevel, StockReceipt, Version,
};

/// `PostgreSQL`-backed [`ProductStore`].
///
/// # Example
///
/// ```no_run
/// use stock_reconciler_postgres::PostgresProductStore;
/// use stock_reconciler_core::product::{ProductId, ProductStore};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresProductStore::new(pool);
/// let level = store.insert(ProductId::new("sku-1"), 10).await?;
/// assert_eq!(level.stock, 10);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresProductStore {
    pool: PgPool,
}

impl PostgresProductStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn adjust_in(
        tx: &mut Transaction<'_, Postgres>,
        request: &AdjustStock,
    ) -> Result<AdjustOutcome, ProductStoreError> {
        let row = sqlx::query(
            r"
            SELECT product_id, stock, version
            FROM products
            WHERE product_id = $1
            FOR UPDATE
            ",
        )
        .bind(request.product_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(unavailable)?
        .ok_or_else(|| ProductStoreError::NotFound(request.product_id.clone()))?;
        let current = level_from_row(&row)?;

        let kinds: Vec<String> = sqlx::query_scalar(
            r"
            SELECT kind
            FROM stock_receipts
            WHERE product_id = $1 AND transaction_id = $2
            ",
        )
        .bind(request.product_id.as_str())
        .bind(request.transaction_id.as_str())
        .fetch_all(&mut **tx)
        .await
        .map_err(unavailable)?;
        let receipted = kinds
            .iter()
            .map(|kind| AdjustmentKind::parse(kind))
            .collect::<Result<Vec<_>, _>>()?;

        match request.evaluate(&current, &receipted)? {
            AdjustDecision::Apply { stock } => {
                let version = current.version.next();
                let stored_version = to_i64(version.value(), "version")
                    .map_err(ProductStoreError::Corrupted)?;
                sqlx::query(
                    r"
                    UPDATE products
                    SET stock = $2, version = $3, updated_at = now()
                    WHERE product_id = $1
                    ",
                )
                .bind(request.product_id.as_str())
                .bind(stock)
                .bind(stored_version)
                .execute(&mut **tx)
                .await
                .map_err(unavailable)?;

                insert_receipt(tx, request, request.delta, stored_version).await?;
                Ok(AdjustOutcome::Applied(StockLevel {
                    product_id: current.product_id,
                    stock,
                    version,
                }))
            }
            AdjustDecision::AlreadyApplied => Ok(AdjustOutcome::AlreadyApplied(current)),
            AdjustDecision::Compensated => Ok(AdjustOutcome::Compensated(current)),
            AdjustDecision::Void => {
                let stored_version = to_i64(current.version.value(), "version")
                    .map_err(ProductStoreError::Corrupted)?;
                insert_receipt(tx, request, 0, stored_version).await?;
                Ok(AdjustOutcome::Voided(current))
            }
        }
    }
}

async fn insert_receipt(
    tx: &mut Transaction<'_, Postgres>,
    request: &AdjustStock,
    delta: i64,
    version: i64,
) -> Result<(), ProductStoreError> {
    sqlx::query(
        r"
        INSERT INTO stock_receipts (product_id, transaction_id, kind, delta, version)
        VALUES ($1, $2, $3, $4, $5)
        ",
    )
    .bind(request.product_id.as_str())
    .bind(request.transaction_id.as_str())
    .bind(request.kind.as_str())
    .bind(delta)
    .bind(version)
    .execute(&mut **tx)
    .await
    .map_err(unavailable)?;
    Ok(())
}

fn unavailable(e: sqlx::Error) -> ProductStoreError {
    ProductStoreError::Unavailable(e.to_string())
}

fn level_from_row(row: &PgRow) -> Result<StockLevel, ProductStoreError> {
    let product_id: String = row.try_get("product_id").map_err(unavailable)?;
    let stock: i64 = row.try_get("stock").map_err(unavailable)?;
    let version: i64 = row.try_get("version").map_err(unavailable)?;
    Ok(StockLevel {
        product_id: ProductId::new(product_id),
        stock,
        version: Version::new(to_u64(version, "version").map_err(ProductStoreError::Corrupted)?),
    })
}

fn receipt_from_row(row: &PgRow) -> Result<StockReceipt, ProductStoreError> {
    let transaction_id: String = row.try_get("transaction_id").map_err(unavailable)?;
    let kind: String = row.try_get("kind").map_err(unavailable)?;
    let version: i64 = row.try_get("version").map_err(unavailable)?;
    Ok(StockReceipt {
        transaction_id: TransactionId::new(transaction_id),
        kind: AdjustmentKind::parse(&kind)?,
        delta: row.try_get("delta").map_err(unavailable)?,
        version: Version::new(to_u64(version, "version").map_err(ProductStoreError::Corrupted)?),
        recorded_at: row.try_get("recorded_at").map_err(unavailable)?,
    })
}

impl ProductStore for PostgresProductStore {
    fn insert(
        &self,
        product_id: ProductId,
        opening_stock: i64,
    ) -> Pin<Box<dyn Future<Output = Result<StockLevel, ProductStoreError>> + Send + '_>> {
        Box::pin(async move {
            if opening_stock < 0 {
                return Err(ProductStoreError::InvalidAdjustment(format!(
                    "opening stock {opening_stock} is negative"
                )));
            }

            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let inserted = sqlx::query(
                r"
                INSERT INTO products (product_id, stock, version)
                VALUES ($1, $2, 0)
                ON CONFLICT (product_id) DO NOTHING
                ",
            )
            .bind(product_id.as_str())
            .bind(opening_stock)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
            if inserted.rows_affected() == 0 {
                let _ = tx.rollback().await;
                return Err(ProductStoreError::AlreadyExists(product_id));
            }

            let opening = AdjustStock {
                product_id: product_id.clone(),
                delta: opening_stock,
                expected_version: Version::INITIAL,
                transaction_id: TransactionId::new(format!("opening:{product_id}")),
                kind: AdjustmentKind::Opening,
            };
            insert_receipt(&mut tx, &opening, opening_stock, 0).await?;
            tx.commit().await.map_err(unavailable)?;

            tracing::debug!(product_id = %product_id, stock = opening_stock, "Product inserted");
            Ok(StockLevel {
                product_id,
                stock: opening_stock,
                version: Version::INITIAL,
            })
        })
    }

    fn load(
        &self,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<StockLevel, ProductStoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT product_id, stock, version
                FROM products
                WHERE product_id = $1
                ",
            )
            .bind(product_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?
            .ok_or(ProductStoreError::NotFound(product_id))?;
            level_from_row(&row)
        })
    }

    fn conditional_adjust(
        &self,
        request: AdjustStock,
    ) -> Pin<Box<dyn Future<Output = Result<AdjustOutcome, ProductStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            match Self::adjust_in(&mut tx, &request).await {
                Ok(outcome) => {
                    tx.commit().await.map_err(unavailable)?;
                    if matches!(outcome, AdjustOutcome::Applied(_)) {
                        metrics::counter!("stock_store_adjustments_total", "kind" => request.kind.as_str())
                            .increment(1);
                    }
                    Ok(outcome)
                }
                Err(err) => {
                    // Nothing was written; release the row lock.
                    let _ = tx.rollback().await;
                    Err(err)
                }
            }
        })
    }

    fn receipts(
        &self,
        product_id: ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StockReceipt>, ProductStoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT transaction_id, kind, delta, version, recorded_at
                FROM stock_receipts
                WHERE product_id = $1
                ORDER BY id ASC
                ",
            )
            .bind(product_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

            if rows.is_empty() {
                // Every product has its opening receipt.
                return Err(ProductStoreError::NotFound(product_id));
            }
            rows.iter().map(receipt_from_row).collect()
        })
    }
}
