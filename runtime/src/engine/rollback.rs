//! Rollback: restore the lines of an applied transaction.

use super::{EngineOutcome, StockEngine};
use stock_reconciler_core::command::RollbackStock;
use stock_reconciler_core::error::StockError;
use stock_reconciler_core::ledger::TransactionState;
use stock_reconciler_core::product::{AdjustOutcome, AdjustmentKind};

impl StockEngine {
    /// Restore the stock a previously applied reduce took, at most once.
    ///
    /// | Record state | Result |
    /// |---|---|
    /// | absent / `Pending` | [`StockError::TransactionNotApplied`] (retry later) |
    /// | `Applied` | lines restored, record `RolledBack`; a recovery sweep finishes an interrupted rollback |
    /// | `RolledBack` | [`EngineOutcome::Duplicate`] |
    /// | `Rejected` | [`EngineOutcome::Duplicate`]; nothing is left to restore |
    ///
    /// # Errors
    ///
    /// - [`StockError::TransactionNotApplied`] if the reduce has not been applied yet
    /// - [`StockError::VersionConflict`] / [`StockError::Unavailable`]: retry later, the
    ///   rollback resumes where it stopped
    /// - [`StockError::Invariant`]: an applied line has no decrement to restore
    #[tracing::instrument(skip(self, command), fields(transaction_id = %command.transaction_id))]
    pub async fn rollback(&self, command: RollbackStock) -> Result<EngineOutcome, StockError> {
        let transaction_id = command.transaction_id;
        let record = self
            .call("ledger.get", || self.ledger.get(transaction_id.clone()))
            .await?;

        let Some(record) = record else {
            tracing::debug!("Rollback arrived before its reduce");
            return Err(StockError::TransactionNotApplied {
                transaction_id,
                state: None,
            });
        };

        match record.state {
            TransactionState::Pending => {
                tracing::debug!("Rollback arrived while its reduce is pending");
                Err(StockError::TransactionNotApplied {
                    transaction_id,
                    state: Some(TransactionState::Pending),
                })
            }
            TransactionState::RolledBack => {
                tracing::debug!("Duplicate rollback");
                Ok(EngineOutcome::Duplicate {
                    transaction_id,
                    state: TransactionState::RolledBack,
                })
            }
            TransactionState::Rejected => {
                self.finish_compensation(&record).await?;
                tracing::info!("Rollback of rejected transaction; nothing to restore");
                Ok(EngineOutcome::Duplicate {
                    transaction_id,
                    state: TransactionState::Rejected,
                })
            }
            TransactionState::Applied => {
                // Flag first: a rollback abandoned halfway is finished by a recovery
                // sweep once this lease runs out.
                let lease_until = self.lease_until(self.clock.now());
                let record = self
                    .call("ledger.begin_rollback", || {
                        self.ledger.begin_rollback(transaction_id.clone(), lease_until)
                    })
                    .await?;
                if record.state == TransactionState::RolledBack {
                    tracing::debug!("Rolled back concurrently");
                    return Ok(EngineOutcome::Duplicate {
                        transaction_id,
                        state: TransactionState::RolledBack,
                    });
                }

                for line in &record.lines {
                    let outcome = self
                        .adjust(
                            &line.product_id,
                            &transaction_id,
                            AdjustmentKind::Restore,
                            i64::from(line.quantity),
                        )
                        .await?;
                    match outcome {
                        AdjustOutcome::Applied(level) => {
                            tracing::debug!(product_id = %line.product_id, stock = level.stock, "Line restored");
                        }
                        AdjustOutcome::AlreadyApplied(_) => {
                            tracing::debug!(product_id = %line.product_id, "Line already restored");
                        }
                        AdjustOutcome::Voided(_) | AdjustOutcome::Compensated(_) => {
                            return Err(StockError::Invariant(format!(
                                "applied transaction {transaction_id} has no decrement of {}",
                                line.product_id
                            )));
                        }
                    }
                }

                self.call("ledger.mark_rolled_back", || {
                    self.ledger
                        .mark_rolled_back(transaction_id.clone(), self.clock.now())
                })
                .await?;

                tracing::info!("Stock restored");
                Ok(EngineOutcome::RolledBack { transaction_id })
            }
        }
    }
}
