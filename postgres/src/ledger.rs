//! `PostgreSQL` transaction ledger.
//!
//! Lines and rejection reasons are stored as JSONB. Every state change runs under
//! `SELECT ... FOR UPDATE` and is decided by the same record methods the in-memory
//! ledger uses, so both agree on leases and transitions.

use crate::{to_i64, to_u64};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use stock_reconciler_core::ledger::{
    BeginDecision, BeginOutcome, BeginTransaction, Lease, LedgerError, LedgerLine,
    RejectionReason, Resolution, TransactionId, TransactionLedger, TransactionRecord,
    TransactionState,
};

const COLUMNS: &str = "transaction_id, lines, state, lease_epoch, lease_expires_at, rejection, compensating, created_at, resolved_at";

/// `PostgreSQL`-backed [`TransactionLedger`].
#[derive(Clone)]
pub struct PostgresTransactionLedger {
    pool: PgPool,
}

impl PostgresTransactionLedger {
    /// Create a ledger over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        transaction_id: &TransactionId,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM stock_transactions WHERE transaction_id = $1 FOR UPDATE"
        ))
        .bind(transaction_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Move a locked record to `target` unless it is already there.
    async fn transition(
        &self,
        transaction_id: TransactionId,
        target: TransactionState,
        epoch: Option<u64>,
        rejection: Option<RejectionReason>,
        now: DateTime<Utc>,
    ) -> Result<TransactionRecord, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let Some(mut record) = Self::lock(&mut tx, &transaction_id).await? else {
            let _ = tx.rollback().await;
            return Err(LedgerError::NotFound(transaction_id));
        };

        let write = match record.check_transition(target, epoch) {
            Ok(write) => write,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        };
        if !write {
            let _ = tx.rollback().await;
            return Ok(record);
        }

        // Only a rejection owes restores; rolling back settles whatever was owed.
        let compensating = target == TransactionState::Rejected;
        let rejection_json = rejection
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| LedgerError::Corrupted(e.to_string()))?;
        sqlx::query(
            r"
            UPDATE stock_transactions
            SET state = $2, rejection = COALESCE($3, rejection), compensating = $4,
                resolved_at = $5
            WHERE transaction_id = $1
            ",
        )
        .bind(transaction_id.as_str())
        .bind(target.as_str())
        .bind(rejection_json)
        .bind(compensating)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;

        record.state = target;
        record.compensating = compensating;
        if rejection.is_some() {
            record.rejection = rejection;
        }
        record.resolved_at = Some(now);
        Ok(record)
    }

    /// Run a flag update that touches at most one row, then read the record back.
    async fn update_flag(
        &self,
        transaction_id: TransactionId,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<TransactionRecord, LedgerError> {
        query.execute(&self.pool).await.map_err(unavailable)?;
        self.get(transaction_id.clone())
            .await?
            .ok_or(LedgerError::NotFound(transaction_id))
    }
}

fn unavailable(e: sqlx::Error) -> LedgerError {
    LedgerError::Unavailable(e.to_string())
}

fn record_from_row(row: &PgRow) -> Result<TransactionRecord, LedgerError> {
    let transaction_id: String = row.try_get("transaction_id").map_err(unavailable)?;
    let lines: serde_json::Value = row.try_get("lines").map_err(unavailable)?;
    let lines: Vec<LedgerLine> =
        serde_json::from_value(lines).map_err(|e| LedgerError::Corrupted(e.to_string()))?;
    let state: String = row.try_get("state").map_err(unavailable)?;
    let epoch: i64 = row.try_get("lease_epoch").map_err(unavailable)?;
    let rejection: Option<serde_json::Value> = row.try_get("rejection").map_err(unavailable)?;
    let rejection = rejection
        .map(serde_json::from_value::<RejectionReason>)
        .transpose()
        .map_err(|e| LedgerError::Corrupted(e.to_string()))?;

    Ok(TransactionRecord {
        transaction_id: TransactionId::new(transaction_id),
        lines,
        state: TransactionState::parse(&state)?,
        lease: Lease {
            epoch: to_u64(epoch, "lease_epoch").map_err(LedgerError::Corrupted)?,
            expires_at: row.try_get("lease_expires_at").map_err(unavailable)?,
        },
        rejection,
        compensating: row.try_get("compensating").map_err(unavailable)?,
        created_at: row.try_get("created_at").map_err(unavailable)?,
        resolved_at: row.try_get("resolved_at").map_err(unavailable)?,
    })
}

impl TransactionLedger for PostgresTransactionLedger {
    fn get(
        &self,
        transaction_id: TransactionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TransactionRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM stock_transactions WHERE transaction_id = $1"
            ))
            .bind(transaction_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
            row.as_ref().map(record_from_row).transpose()
        })
    }

    fn begin(
        &self,
        request: BeginTransaction,
    ) -> Pin<Box<dyn Future<Output = Result<BeginOutcome, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let fresh = request.new_record();
            let lines = serde_json::to_value(&fresh.lines)
                .map_err(|e| LedgerError::Corrupted(e.to_string()))?;
            let epoch = to_i64(fresh.lease.epoch, "lease_epoch").map_err(LedgerError::Corrupted)?;

            let mut tx = self.pool.begin().await.map_err(unavailable)?;
            let created = sqlx::query(
                r"
                INSERT INTO stock_transactions
                    (transaction_id, lines, state, lease_epoch, lease_expires_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (transaction_id) DO NOTHING
                ",
            )
            .bind(fresh.transaction_id.as_str())
            .bind(lines)
            .bind(fresh.state.as_str())
            .bind(epoch)
            .bind(fresh.lease.expires_at)
            .bind(fresh.created_at)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
            if created.rows_affected() == 1 {
                tx.commit().await.map_err(unavailable)?;
                return Ok(BeginOutcome::Started(fresh));
            }

            let Some(mut record) = Self::lock(&mut tx, &request.transaction_id).await? else {
                let _ = tx.rollback().await;
                return Err(LedgerError::Corrupted(format!(
                    "transaction {} vanished during begin",
                    request.transaction_id
                )));
            };

            let outcome = match record.begin_decision(request.now) {
                BeginDecision::Resolved => BeginOutcome::Resolved(record),
                BeginDecision::InFlight => BeginOutcome::InFlight {
                    lease_expires_at: record.lease.expires_at,
                },
                BeginDecision::Claim { epoch } => {
                    let stored_epoch = to_i64(epoch, "lease_epoch").map_err(LedgerError::Corrupted)?;
                    sqlx::query(
                        r"
                        UPDATE stock_transactions
                        SET lease_epoch = $2, lease_expires_at = $3
                        WHERE transaction_id = $1
                        ",
                    )
                    .bind(request.transaction_id.as_str())
                    .bind(stored_epoch)
                    .bind(request.lease_until)
                    .execute(&mut *tx)
                    .await
                    .map_err(unavailable)?;
                    record.lease = Lease {
                        epoch,
                        expires_at: request.lease_until,
                    };
                    BeginOutcome::Resumed(record)
                }
            };
            tx.commit().await.map_err(unavailable)?;
            Ok(outcome)
        })
    }

    fn resolve(
        &self,
        transaction_id: TransactionId,
        epoch: u64,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let target = resolution.state();
            let rejection = match resolution {
                Resolution::Applied => None,
                Resolution::Rejected(reason) => Some(reason),
            };
            self.transition(transaction_id, target, Some(epoch), rejection, now)
                .await
        })
    }

    fn release_lease(
        &self,
        transaction_id: TransactionId,
        epoch: u64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let epoch = to_i64(epoch, "lease_epoch").map_err(LedgerError::Corrupted)?;
            sqlx::query(
                r"
                UPDATE stock_transactions
                SET lease_expires_at = LEAST(lease_expires_at, $3)
                WHERE transaction_id = $1 AND state = 'pending' AND lease_epoch = $2
                ",
            )
            .bind(transaction_id.as_str())
            .bind(epoch)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
            Ok(())
        })
    }

    fn begin_rollback(
        &self,
        transaction_id: TransactionId,
        lease_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE stock_transactions
                SET compensating = TRUE, lease_expires_at = $2
                WHERE transaction_id = $1 AND state = 'applied'
                ",
            )
            .bind(transaction_id.as_str())
            .bind(lease_until);
            self.update_flag(transaction_id.clone(), query).await
        })
    }

    fn settle_compensation(
        &self,
        transaction_id: TransactionId,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE stock_transactions
                SET compensating = FALSE
                WHERE transaction_id = $1 AND state = 'rejected'
                ",
            )
            .bind(transaction_id.as_str());
            self.update_flag(transaction_id.clone(), query).await
        })
    }

    fn mark_rolled_back(
        &self,
        transaction_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.transition(transaction_id, TransactionState::RolledBack, None, None, now)
                .await
        })
    }

    fn list_stalled(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<TransactionRecord>, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = sqlx::query(&format!(
                r"
                SELECT {COLUMNS}
                FROM stock_transactions
                WHERE (state = 'pending' OR compensating) AND lease_expires_at <= $1
                ORDER BY created_at ASC
                LIMIT $2
                "
            ))
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
            rows.iter().map(record_from_row).collect()
        })
    }
}
