//! Receipt-based stock audit.

use super::StockEngine;
use crate::metrics::EngineMetrics;
use crate::retry::{RetryError, retry_with_predicate};
use stock_reconciler_core::error::StockError;
use stock_reconciler_core::product::{ProductId, Version};

/// Stored stock of a product compared with the sum of its receipts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockAudit {
    /// The audited product.
    pub product_id: ProductId,
    /// Stock as stored.
    pub recorded: i64,
    /// Sum of every receipt's delta, opening stock included.
    pub reconstructed: i64,
    /// Number of receipts summed.
    pub receipts: usize,
    /// Version the audit was taken at.
    pub version: Version,
}

impl StockAudit {
    /// Whether the stored stock is explained by the receipts and non-negative.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.recorded == self.reconstructed && self.recorded >= 0
    }
}

impl StockEngine {
    /// Rebuild a product's stock from its receipts and compare with the stored value.
    ///
    /// The level is read before and after the receipts; if it moved in between the
    /// audit is retried like any other version conflict.
    ///
    /// # Errors
    ///
    /// - [`StockError::UnknownProduct`] if the product does not exist
    /// - [`StockError::VersionConflict`] if the product never held still
    /// - [`StockError::Unavailable`] if the store cannot be reached
    #[tracing::instrument(skip(self))]
    pub async fn audit(&self, product_id: &ProductId) -> Result<StockAudit, StockError> {
        let attempt = move || async move {
            let before = self.stock_level(product_id).await?;
            let receipts = self
                .call("products.receipts", || self.products.receipts(product_id.clone()))
                .await?;
            let after = self.stock_level(product_id).await?;
            if before.version != after.version {
                return Err(StockError::VersionConflict {
                    product_id: product_id.clone(),
                    expected: before.version,
                    actual: after.version,
                });
            }
            Ok(StockAudit {
                product_id: product_id.clone(),
                recorded: after.stock,
                reconstructed: receipts.iter().map(|receipt| receipt.delta).sum(),
                receipts: receipts.len(),
                version: after.version,
            })
        };

        let audit = retry_with_predicate(
            &self.config.conflict_retry,
            attempt,
            StockError::is_version_conflict,
        )
        .await
        .map_err(RetryError::into_inner)?;

        if audit.is_consistent() {
            tracing::debug!(stock = audit.recorded, receipts = audit.receipts, "Audit passed");
        } else {
            EngineMetrics::record_audit_mismatch();
            tracing::error!(
                recorded = audit.recorded,
                reconstructed = audit.reconstructed,
                receipts = audit.receipts,
                "Stock does not match its receipts"
            );
        }
        Ok(audit)
    }
}
