//! Sweeping up transactions whose driver died mid-reduce or mid-compensation.

use super::{EngineOutcome, StockEngine};
use crate::metrics::RecoveryMetrics;
use stock_reconciler_core::command::{ReduceStock, RollbackStock};
use stock_reconciler_core::error::StockError;
use stock_reconciler_core::ledger::TransactionState;

/// What one recovery sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stalled records found.
    pub scanned: usize,
    /// Driven to `Applied`.
    pub applied: usize,
    /// Driven to or found `Rejected`, and compensated.
    pub rejected: usize,
    /// Interrupted rollbacks finished.
    pub rolled_back: usize,
    /// Already taken over or resolved by someone else.
    pub skipped: usize,
    /// Still failing; left for the next sweep.
    pub failed: usize,
}

impl StockEngine {
    /// Resume up to `limit` stalled transactions whose lease has expired.
    ///
    /// A `Pending` or `Rejected` record is driven exactly as a redelivered reduce
    /// would be, from its recorded lines; an `Applied` record owing restores is
    /// rolled back. A crash (or a delivery given up on) between the ledger write and
    /// the last adjustment therefore never leaves stock half-moved for longer than a
    /// lease plus a sweep interval.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Unavailable`] if the ledger cannot be scanned. Failures
    /// of individual transactions are counted in the report instead.
    #[tracing::instrument(skip(self))]
    pub async fn recover_stalled(&self, limit: usize) -> Result<RecoveryReport, StockError> {
        let now = self.clock.now();
        let stalled = self
            .call("ledger.list_stalled", || self.ledger.list_stalled(now, limit))
            .await?;

        RecoveryMetrics::record_run();
        let mut report = RecoveryReport {
            scanned: stalled.len(),
            ..RecoveryReport::default()
        };

        for record in stalled {
            let transaction_id = record.transaction_id.clone();
            let outcome = if record.state == TransactionState::Applied {
                self.rollback(RollbackStock {
                    transaction_id: record.transaction_id,
                })
                .await
            } else {
                self.reduce(ReduceStock {
                    transaction_id: record.transaction_id,
                    lines: record.lines,
                })
                .await
            };
            let result = match outcome {
                Ok(EngineOutcome::Applied { .. }) => {
                    report.applied += 1;
                    "applied"
                }
                Ok(EngineOutcome::RolledBack { .. }) => {
                    report.rolled_back += 1;
                    "rolled_back"
                }
                Ok(_) => {
                    report.skipped += 1;
                    "skipped"
                }
                Err(err) if err.kind().is_business_rejection() => {
                    report.rejected += 1;
                    "rejected"
                }
                Err(StockError::InFlight { .. } | StockError::LeaseLost { .. }) => {
                    report.skipped += 1;
                    "skipped"
                }
                Err(err) => {
                    tracing::warn!(transaction_id = %transaction_id, error = %err, "Recovery of stalled transaction failed");
                    report.failed += 1;
                    "failed"
                }
            };
            RecoveryMetrics::record_transaction(result);
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                applied = report.applied,
                rejected = report.rejected,
                rolled_back = report.rolled_back,
                skipped = report.skipped,
                failed = report.failed,
                "Recovery sweep finished"
            );
        }
        Ok(report)
    }
}
