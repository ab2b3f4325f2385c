//! Reduce: ledger first, then one keyed decrement per line.

use super::{EngineOutcome, StockEngine};
use crate::metrics::EngineMetrics;
use stock_reconciler_core::command::ReduceStock;
use stock_reconciler_core::error::StockError;
use stock_reconciler_core::ledger::{
    BeginOutcome, BeginTransaction, RejectionReason, Resolution, TransactionRecord,
    TransactionState,
};
use stock_reconciler_core::product::{AdjustOutcome, AdjustmentKind};

impl StockEngine {
    /// Decrement stock for every line of a placed order, all or nothing.
    ///
    /// A transaction id is acted on once: replays of an applied or rolled-back
    /// transaction report [`EngineOutcome::Duplicate`], replays of a rejected one
    /// report the recorded rejection again.
    ///
    /// # Errors
    ///
    /// - [`StockError::InsufficientStock`] / [`StockError::UnknownProduct`]: the reduce
    ///   was rejected and any partial decrements were restored
    /// - [`StockError::InFlight`] / [`StockError::LeaseLost`]: another driver owns the
    ///   transaction; retry later
    /// - [`StockError::VersionConflict`] / [`StockError::Unavailable`]: retry later,
    ///   the transaction resumes where it stopped
    /// - [`StockError::Invariant`]: stored data is inconsistent
    #[tracing::instrument(skip(self, command), fields(transaction_id = %command.transaction_id, lines = command.lines.len()))]
    pub async fn reduce(&self, command: ReduceStock) -> Result<EngineOutcome, StockError> {
        let now = self.clock.now();
        let request = BeginTransaction {
            transaction_id: command.transaction_id,
            lines: command.lines,
            now,
            lease_until: self.lease_until(now),
        };

        let begun = self
            .call("ledger.begin", || self.ledger.begin(request.clone()))
            .await?;

        match begun {
            BeginOutcome::Started(record) => {
                tracing::debug!("Transaction recorded");
                self.drive(record).await
            }
            BeginOutcome::Resumed(record) => {
                if record.lines != request.lines {
                    tracing::warn!("Redelivered lines differ from the recorded ones; using recorded lines");
                }
                tracing::info!(epoch = record.lease.epoch, "Resuming stalled transaction");
                EngineMetrics::record_resumed();
                self.drive(record).await
            }
            BeginOutcome::InFlight { lease_expires_at } => {
                tracing::debug!(%lease_expires_at, "Transaction is being driven elsewhere");
                Err(StockError::InFlight {
                    transaction_id: request.transaction_id,
                    lease_expires_at,
                })
            }
            BeginOutcome::Resolved(record) => self.replay_resolved(record).await,
        }
    }

    /// Drive a pending record held under its current lease epoch to a resolution.
    async fn drive(&self, record: TransactionRecord) -> Result<EngineOutcome, StockError> {
        let epoch = record.lease.epoch;
        let transaction_id = &record.transaction_id;

        for line in &record.lines {
            let delta = -i64::from(line.quantity);
            let outcome = match self
                .adjust(&line.product_id, transaction_id, AdjustmentKind::Reduce, delta)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    if let Some(reason) = err.rejection() {
                        return self.reject(&record, reason).await;
                    }
                    self.release(&record).await;
                    return Err(err);
                }
            };

            match outcome {
                AdjustOutcome::Applied(level) => {
                    tracing::debug!(product_id = %line.product_id, stock = level.stock, "Line reduced");
                }
                AdjustOutcome::AlreadyApplied(_) => {
                    tracing::debug!(product_id = %line.product_id, "Line already reduced");
                }
                AdjustOutcome::Compensated(_) => {
                    // Only a driver that took over and rejected the transaction writes
                    // restores while it is still pending here.
                    tracing::warn!(product_id = %line.product_id, epoch, "Transaction was compensated by another driver");
                    return Err(StockError::LeaseLost {
                        transaction_id: transaction_id.clone(),
                        epoch,
                    });
                }
                AdjustOutcome::Voided(_) => {
                    return Err(StockError::Invariant(format!(
                        "reduce of {} for transaction {transaction_id} was voided",
                        line.product_id
                    )));
                }
            }
        }

        self.call("ledger.resolve", || {
            self.ledger.resolve(
                transaction_id.clone(),
                epoch,
                Resolution::Applied,
                self.clock.now(),
            )
        })
        .await?;

        tracing::info!("Stock reduced");
        Ok(EngineOutcome::Applied {
            transaction_id: transaction_id.clone(),
        })
    }

    /// Resolve the record `Rejected`, then restore whatever was already taken.
    ///
    /// The record is resolved first: once it is `Rejected` no other driver can
    /// resume the reduce, so compensation cannot race a late decrement. Until the
    /// restores are settled the record stays visible to recovery sweeps.
    async fn reject(
        &self,
        record: &TransactionRecord,
        reason: RejectionReason,
    ) -> Result<EngineOutcome, StockError> {
        tracing::warn!(reason = %reason, "Rejecting reduce");

        self.call("ledger.resolve", || {
            self.ledger.resolve(
                record.transaction_id.clone(),
                record.lease.epoch,
                Resolution::Rejected(reason.clone()),
                self.clock.now(),
            )
        })
        .await?;

        self.finish_compensation(record).await?;

        let err = StockError::from(reason);
        EngineMetrics::record_rejection(err.kind());
        Err(err)
    }

    /// Restore every line of a rejected transaction and clear its owed-restores flag.
    pub(super) async fn finish_compensation(&self, record: &TransactionRecord) -> Result<(), StockError> {
        self.compensate(record).await?;
        self.call("ledger.settle_compensation", || {
            self.ledger.settle_compensation(record.transaction_id.clone())
        })
        .await?;
        Ok(())
    }

    /// Restore every line of a rejected transaction. Lines that were never reduced
    /// get a void tombstone instead.
    async fn compensate(&self, record: &TransactionRecord) -> Result<(), StockError> {
        for line in &record.lines {
            let outcome = self
                .adjust(
                    &line.product_id,
                    &record.transaction_id,
                    AdjustmentKind::Restore,
                    i64::from(line.quantity),
                )
                .await;

            match outcome {
                Err(StockError::UnknownProduct(product_id)) => {
                    tracing::debug!(product_id = %product_id, "Nothing to compensate on unknown product");
                }
                Err(err) => return Err(err),
                Ok(AdjustOutcome::Applied(_)) => {
                    tracing::info!(product_id = %line.product_id, quantity = line.quantity, "Partial reduce compensated");
                }
                Ok(AdjustOutcome::AlreadyApplied(_) | AdjustOutcome::Voided(_)) => {}
                Ok(AdjustOutcome::Compensated(_)) => {
                    return Err(StockError::Invariant(format!(
                        "restore of {} for transaction {} reported compensated",
                        line.product_id, record.transaction_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Answer a reduce for a transaction that is already resolved.
    async fn replay_resolved(&self, record: TransactionRecord) -> Result<EngineOutcome, StockError> {
        match record.state {
            TransactionState::Applied | TransactionState::RolledBack => {
                tracing::debug!(state = %record.state, "Duplicate reduce");
                Ok(EngineOutcome::Duplicate {
                    transaction_id: record.transaction_id,
                    state: record.state,
                })
            }
            TransactionState::Rejected => {
                // A crash between resolving and compensating leaves restores
                // missing; replaying heals that.
                self.finish_compensation(&record).await?;
                let reason = record.rejection.ok_or_else(|| {
                    StockError::Invariant(format!(
                        "rejected transaction {} has no rejection reason",
                        record.transaction_id
                    ))
                })?;
                tracing::debug!(reason = %reason, "Replayed rejected reduce");
                Err(reason.into())
            }
            TransactionState::Pending => Err(StockError::Invariant(format!(
                "ledger reported pending transaction {} as resolved",
                record.transaction_id
            ))),
        }
    }

    /// Hand the lease back after a recoverable failure. Best effort: if this fails
    /// the lease simply runs out.
    async fn release(&self, record: &TransactionRecord) {
        let result = self
            .call("ledger.release_lease", || {
                self.ledger.release_lease(
                    record.transaction_id.clone(),
                    record.lease.epoch,
                    self.clock.now(),
                )
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(error = %err, "Could not release lease");
        }
    }
}
