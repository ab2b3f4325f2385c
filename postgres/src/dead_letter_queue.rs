//! Dead Letter Queue (DLQ) for deliveries the intake gave up on.
//!
//! Provides persistent storage and management of messages that were rejected for
//! good or exhausted their redelivery budget. Enables observability, incident
//! response, and manual replay workflows.

use crate::PostgresError;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use stock_reconciler_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use stock_reconciler_core::error::ErrorKind;
use stock_reconciler_core::ledger::TransactionId;

/// Status of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation/replay
    Pending,
    /// Someone is working on it
    Processing,
    /// Replayed or otherwise fixed
    Resolved,
    /// Permanently discarded (cannot be fixed)
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Corrupted`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, PostgresError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(PostgresError::Corrupted(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// A stored dead letter plus its handling metadata.
#[derive(Debug, Clone)]
pub struct FailedDelivery {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// The letter as the intake wrote it
    pub letter: DeadLetter,

    /// Current handling status
    pub status: DLQStatus,

    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the entry
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue.
///
/// Doubles as the intake's [`DeadLetterSink`].
///
/// # Example
///
/// ```no_run
/// use stock_reconciler_postgres::{DLQStatus, DeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// // List pending failures
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// // Mark one as processing
/// dlq.update_status(pending[0].id, DLQStatus::Processing).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

const COLUMNS: &str = "id, transaction_id, event, payload, kind, error_message, redelivery_count, \
    failed_at, status, resolved_at, resolved_by, resolution_notes";

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a dead letter.
    ///
    /// # Returns
    ///
    /// The unique ID of the created DLQ entry.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, PostgresError> {
        let redelivery_count = i32::try_from(letter.redelivery_count).unwrap_or(i32::MAX);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letters (
                transaction_id, event, payload, kind, error_message,
                redelivery_count, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(letter.transaction_id.as_ref().map(TransactionId::as_str))
        .bind(letter.event.as_deref())
        .bind(&letter.payload)
        .bind(letter.kind.as_str())
        .bind(&letter.error_message)
        .bind(redelivery_count)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PostgresError::Database(e.to_string()))?;

        tracing::warn!(
            dlq_id = id,
            transaction_id = ?letter.transaction_id,
            kind = %letter.kind,
            error = %letter.error_message,
            redelivery_count = letter.redelivery_count,
            "Delivery added to Dead Letter Queue"
        );

        Ok(id)
    }

    /// List pending dead letters, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedDelivery>, PostgresError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List dead letters by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedDelivery>, PostgresError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dead_letters WHERE status = $1 ORDER BY failed_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PostgresError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_delivery).collect()
    }

    /// Get a specific dead letter by ID.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the query fails or the entry is not found.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedDelivery, PostgresError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM dead_letters WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PostgresError::Database(e.to_string()))?;

        Self::row_to_failed_delivery(&row)
    }

    /// Update the status of a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), PostgresError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = $1, updated_at = now()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| PostgresError::Database(e.to_string()))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark a dead letter as resolved.
    ///
    /// # Arguments
    ///
    /// * `id` - The DLQ entry ID
    /// * `resolved_by` - Who/what resolved it (e.g., username, service name)
    /// * `notes` - Resolution notes (what was done)
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), PostgresError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'resolved',
                updated_at = now(),
                resolved_at = now(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| PostgresError::Database(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("stock_dead_letters_resolved_total").increment(1);

        Ok(())
    }

    /// Mark a dead letter as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), PostgresError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'discarded',
                updated_at = now(),
                resolved_at = now(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| PostgresError::Database(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");

        metrics::counter!("stock_dead_letters_discarded_total").increment(1);

        Ok(())
    }

    /// Number of pending dead letters, for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, PostgresError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PostgresError::Database(e.to_string()))?;

        Ok(count)
    }

    fn row_to_failed_delivery(row: &sqlx::postgres::PgRow) -> Result<FailedDelivery, PostgresError> {
        let db = |e: sqlx::Error| PostgresError::Database(e.to_string());

        let kind: String = row.try_get("kind").map_err(db)?;
        let kind = ErrorKind::parse(&kind)
            .ok_or_else(|| PostgresError::Corrupted(format!("Invalid error kind: {kind}")))?;
        let status: String = row.try_get("status").map_err(db)?;
        let redelivery_count: i32 = row.try_get("redelivery_count").map_err(db)?;
        let transaction_id: Option<String> = row.try_get("transaction_id").map_err(db)?;

        Ok(FailedDelivery {
            id: row.try_get("id").map_err(db)?,
            letter: DeadLetter {
                transaction_id: transaction_id.map(TransactionId::new),
                event: row.try_get("event").map_err(db)?,
                payload: row.try_get("payload").map_err(db)?,
                kind,
                error_message: row.try_get("error_message").map_err(db)?,
                redelivery_count: u32::try_from(redelivery_count).unwrap_or_default(),
                failed_at: row.try_get("failed_at").map_err(db)?,
            },
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(db)?,
            resolved_by: row.try_get("resolved_by").map_err(db)?,
            resolution_notes: row.try_get("resolution_notes").map_err(db)?,
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.add_entry(&letter)
                .await
                .map(|_| ())
                .map_err(|e| DeadLetterError::WriteFailed(e.to_string()))
        })
    }
}
