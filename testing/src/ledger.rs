//! In-memory transaction ledger with fault injection.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use stock_reconciler_core::ledger::{
    BeginDecision, BeginOutcome, BeginTransaction, LedgerError, Lease, Resolution,
    TransactionId, TransactionLedger, TransactionRecord, TransactionState,
};

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    failing_resolves: usize,
    failing_releases: bool,
}

/// `HashMap`-backed [`TransactionLedger`] for fast, deterministic tests.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTransactionLedger {
    records: Arc<RwLock<HashMap<TransactionId, TransactionRecord>>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryTransactionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A record, bypassing faults.
    #[must_use]
    pub fn record(&self, transaction_id: &TransactionId) -> Option<TransactionRecord> {
        self.records.read().unwrap().get(transaction_id).cloned()
    }

    /// Store a record as is, e.g. to stage the state a crashed driver left behind.
    pub fn put(&self, record: TransactionRecord) {
        self.records
            .write()
            .unwrap()
            .insert(record.transaction_id.clone(), record);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether the ledger has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Make every call fail with [`LedgerError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unwrap().unavailable = unavailable;
    }

    /// Fail the next `count` resolve calls.
    pub fn fail_next_resolves(&self, count: usize) {
        self.faults.lock().unwrap().failing_resolves = count;
    }

    /// Fail every lease release, as a driver that crashes before releasing would.
    pub fn fail_releases(&self, failing: bool) {
        self.faults.lock().unwrap().failing_releases = failing;
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.faults.lock().unwrap().unavailable {
            return Err(LedgerError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

impl TransactionLedger for InMemoryTransactionLedger {
    fn get(
        &self,
        transaction_id: TransactionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TransactionRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.record(&transaction_id))
        })
    }

    fn begin(
        &self,
        request: BeginTransaction,
    ) -> Pin<Box<dyn Future<Output = Result<BeginOutcome, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut records = self.records.write().unwrap();
            let Some(record) = records.get_mut(&request.transaction_id) else {
                let record = request.new_record();
                records.insert(record.transaction_id.clone(), record.clone());
                return Ok(BeginOutcome::Started(record));
            };

            Ok(match record.begin_decision(request.now) {
                BeginDecision::Resolved => BeginOutcome::Resolved(record.clone()),
                BeginDecision::InFlight => BeginOutcome::InFlight {
                    lease_expires_at: record.lease.expires_at,
                },
                BeginDecision::Claim { epoch } => {
                    record.lease = Lease {
                        epoch,
                        expires_at: request.lease_until,
                    };
                    BeginOutcome::Resumed(record.clone())
                }
            })
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
            self.check_available()?;
            {
                let mut faults = self.faults.lock().unwrap();
                if faults.failing_resolves > 0 {
                    faults.failing_resolves -= 1;
                    return Err(LedgerError::Unavailable("injected resolve failure".to_string()));
                }
            }

            let mut records = self.records.write().unwrap();
            let record = records
                .get_mut(&transaction_id)
                .ok_or_else(|| LedgerError::NotFound(transaction_id.clone()))?;
            if record.check_transition(resolution.state(), Some(epoch))? {
                record.state = resolution.state();
                record.compensating = matches!(resolution, Resolution::Rejected(_));
                record.rejection = match resolution {
                    Resolution::Applied => None,
                    Resolution::Rejected(reason) => Some(reason),
                };
                record.resolved_at = Some(now);
            }
            Ok(record.clone())
        })
    }

    fn release_lease(
        &self,
        transaction_id: TransactionId,
        epoch: u64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            if self.faults.lock().unwrap().failing_releases {
                return Err(LedgerError::Unavailable("injected release failure".to_string()));
            }
            let mut records = self.records.write().unwrap();
            if let Some(record) = records.get_mut(&transaction_id) {
                if record.state == TransactionState::Pending && record.lease.epoch == epoch {
                    record.lease.expires_at = record.lease.expires_at.min(now);
                }
            }
            Ok(())
        })
    }

    fn begin_rollback(
        &self,
        transaction_id: TransactionId,
        lease_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut records = self.records.write().unwrap();
            let record = records
                .get_mut(&transaction_id)
                .ok_or_else(|| LedgerError::NotFound(transaction_id.clone()))?;
            if record.state == TransactionState::Applied {
                record.compensating = true;
                record.lease.expires_at = lease_until;
            }
            Ok(record.clone())
        })
    }

    fn settle_compensation(
        &self,
        transaction_id: TransactionId,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut records = self.records.write().unwrap();
            let record = records
                .get_mut(&transaction_id)
                .ok_or_else(|| LedgerError::NotFound(transaction_id.clone()))?;
            if record.state == TransactionState::Rejected {
                record.compensating = false;
            }
            Ok(record.clone())
        })
    }

    fn mark_rolled_back(
        &self,
        transaction_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<TransactionRecord, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut records = self.records.write().unwrap();
            let record = records
                .get_mut(&transaction_id)
                .ok_or_else(|| LedgerError::NotFound(transaction_id.clone()))?;
            if record.check_transition(TransactionState::RolledBack, None)? {
                record.state = TransactionState::RolledBack;
                record.compensating = false;
                record.resolved_at = Some(now);
            }
            Ok(record.clone())
        })
    }

    fn list_stalled(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<TransactionRecord>, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut stalled: Vec<TransactionRecord> = self
                .records
                .read()
                .unwrap()
                .values()
                .filter(|record| record.is_stalled(now))
                .cloned()
                .collect();
            stalled.sort_by_key(|record| record.created_at);
            stalled.truncate(limit);
            Ok(stalled)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stock_reconciler_core::ledger::{LedgerLine, RejectionReason};
    use stock_reconciler_core::product::ProductId;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600 + secs, 0).unwrap()
    }

    fn begin(tx: &str, now: i64) -> BeginTransaction {
        BeginTransaction {
            transaction_id: TransactionId::new(tx),
            lines: vec![LedgerLine::new("a", 1)],
            now: at(now),
            lease_until: at(now + 30),
        }
    }

    #[tokio::test]
    async fn second_begin_within_lease_is_in_flight() {
        let ledger = InMemoryTransactionLedger::new();
        assert!(matches!(
            ledger.begin(begin("tx", 0)).await.unwrap(),
            BeginOutcome::Started(_)
        ));
        assert!(matches!(
            ledger.begin(begin("tx", 10)).await.unwrap(),
            BeginOutcome::InFlight { .. }
        ));
    }

    #[tokio::test]
    async fn expired_lease_is_resumed_and_old_epoch_is_fenced() {
        let ledger = InMemoryTransactionLedger::new();
        ledger.begin(begin("tx", 0)).await.unwrap();

        let outcome = ledger.begin(begin("tx", 60)).await.unwrap();
        assert!(matches!(outcome, BeginOutcome::Resumed(ref record) if record.lease.epoch == 2));

        let err = ledger
            .resolve(TransactionId::new("tx"), 1, Resolution::Applied, at(61))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::StaleLease { held: 1, current: 2, .. }));
    }

    #[tokio::test]
    async fn release_lets_the_next_begin_claim_immediately() {
        let ledger = InMemoryTransactionLedger::new();
        ledger.begin(begin("tx", 0)).await.unwrap();
        ledger
            .release_lease(TransactionId::new("tx"), 1, at(5))
            .await
            .unwrap();

        assert!(matches!(
            ledger.begin(begin("tx", 5)).await.unwrap(),
            BeginOutcome::Resumed(_)
        ));
    }

    #[tokio::test]
    async fn stalled_records_are_listed_oldest_first() {
        let ledger = InMemoryTransactionLedger::new();
        ledger.begin(begin("late", 20)).await.unwrap();
        ledger.begin(begin("early", 0)).await.unwrap();
        ledger.begin(begin("live", 100)).await.unwrap();

        let stalled = ledger.list_stalled(at(100), 10).await.unwrap();
        let ids: Vec<&str> = stalled.iter().map(|r| r.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn unsettled_rejection_is_stalled_until_settled() {
        let ledger = InMemoryTransactionLedger::new();
        ledger.begin(begin("tx", 0)).await.unwrap();
        let reason = RejectionReason::UnknownProduct {
            product_id: ProductId::new("a"),
        };
        let rejected = ledger
            .resolve(TransactionId::new("tx"), 1, Resolution::Rejected(reason), at(1))
            .await
            .unwrap();
        assert!(rejected.compensating);
        assert_eq!(ledger.list_stalled(at(60), 10).await.unwrap().len(), 1);

        let settled = ledger
            .settle_compensation(TransactionId::new("tx"))
            .await
            .unwrap();
        assert!(!settled.compensating);
        assert!(ledger.list_stalled(at(60), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn started_rollback_is_stalled_until_rolled_back() {
        let ledger = InMemoryTransactionLedger::new();
        ledger.begin(begin("tx", 0)).await.unwrap();
        ledger
            .resolve(TransactionId::new("tx"), 1, Resolution::Applied, at(1))
            .await
            .unwrap();
        assert!(ledger.list_stalled(at(60), 10).await.unwrap().is_empty());

        let started = ledger
            .begin_rollback(TransactionId::new("tx"), at(90))
            .await
            .unwrap();
        assert!(started.compensating);
        assert!(ledger.list_stalled(at(60), 10).await.unwrap().is_empty());
        assert_eq!(ledger.list_stalled(at(90), 10).await.unwrap().len(), 1);

        let rolled_back = ledger
            .mark_rolled_back(TransactionId::new("tx"), at(91))
            .await
            .unwrap();
        assert!(!rolled_back.compensating);
        assert!(ledger.list_stalled(at(120), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn begin_rollback_leaves_other_states_alone() {
        let ledger = InMemoryTransactionLedger::new();
        ledger.begin(begin("tx", 0)).await.unwrap();
        let record = ledger
            .begin_rollback(TransactionId::new("tx"), at(90))
            .await
            .unwrap();
        assert_eq!(record.state, TransactionState::Pending);
        assert!(!record.compensating);
        assert_eq!(record.lease.expires_at, at(30));
    }

    #[tokio::test]
    async fn rolling_back_a_pending_record_is_invalid() {
        let ledger = InMemoryTransactionLedger::new();
        ledger.begin(begin("tx", 0)).await.unwrap();
        let err = ledger
            .mark_rolled_back(TransactionId::new("tx"), at(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }
}
