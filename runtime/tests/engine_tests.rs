//! Integration tests for the stock adjustment engine
//!
//! Drives reduce, rollback, restock, audit and recovery against the in-memory
//! stores, including injected outages, conflicts and crashed drivers.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use stock_reconciler_core::command::{ReduceStock, RollbackStock};
use stock_reconciler_core::error::{ErrorKind, StockError};
use stock_reconciler_core::ledger::{
    BeginTransaction, LedgerLine, RejectionReason, TransactionId, TransactionLedger,
    TransactionState,
};
use stock_reconciler_core::product::{
    AdjustOutcome, AdjustStock, AdjustmentKind, ProductId, ProductStore,
};
use stock_reconciler_runtime::{EngineConfig, EngineOutcome, RetryPolicy, StockEngine};
use stock_reconciler_testing::helpers::init_tracing;
use stock_reconciler_testing::{
    InMemoryProductStore, InMemoryTransactionLedger, ManualClock, test_epoch,
};

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    products: Arc<InMemoryProductStore>,
    ledger: Arc<InMemoryTransactionLedger>,
    clock: ManualClock,
    engine: StockEngine,
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        conflict_retry: RetryPolicy::builder()
            .max_retries(10)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build(),
        store_retry: RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build(),
        call_timeout: Duration::from_millis(200),
        lease_ttl: Duration::from_secs(30),
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_config(fast_config())
    }

    fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let clock = ManualClock::new(test_epoch());
        let products = Arc::new(InMemoryProductStore::with_clock(Arc::new(clock.clone())));
        let ledger = Arc::new(InMemoryTransactionLedger::new());
        let engine = StockEngine::new(
            products.clone(),
            ledger.clone(),
            Arc::new(clock.clone()),
            config,
        );
        Self {
            products,
            ledger,
            clock,
            engine,
        }
    }

    async fn seed(&self, catalogue: &[(&str, u32)]) {
        for (product, stock) in catalogue {
            self.engine
                .register_product(ProductId::new(*product), *stock)
                .await
                .unwrap();
        }
    }

    fn stock(&self, product: &str) -> i64 {
        self.products.stock(&ProductId::new(product)).unwrap()
    }

    fn state(&self, tx: &str) -> Option<TransactionState> {
        self.ledger
            .record(&TransactionId::new(tx))
            .map(|record| record.state)
    }

    async fn assert_consistent(&self, product: &str) {
        let audit = self.engine.audit(&ProductId::new(product)).await.unwrap();
        assert!(audit.is_consistent(), "audit failed: {audit:?}");
    }
}

fn reduce(tx: &str, lines: &[(&str, u32)]) -> ReduceStock {
    ReduceStock {
        transaction_id: TransactionId::new(tx),
        lines: lines
            .iter()
            .map(|(product, quantity)| LedgerLine::new(*product, *quantity))
            .collect(),
    }
}

fn rollback(tx: &str) -> RollbackStock {
    RollbackStock {
        transaction_id: TransactionId::new(tx),
    }
}

// ============================================================================
// Reduce
// ============================================================================

#[tokio::test]
async fn reduce_decrements_every_line() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 5)]).await;

    let outcome = h.engine.reduce(reduce("tx-1", &[("a", 2), ("b", 1)])).await.unwrap();

    assert_eq!(
        outcome,
        EngineOutcome::Applied {
            transaction_id: TransactionId::new("tx-1")
        }
    );
    assert_eq!(h.stock("a"), 8);
    assert_eq!(h.stock("b"), 4);
    assert_eq!(h.state("tx-1"), Some(TransactionState::Applied));
}

#[tokio::test]
async fn reduce_to_exactly_zero_succeeds() {
    let h = Harness::new();
    h.seed(&[("a", 3)]).await;

    h.engine.reduce(reduce("tx-1", &[("a", 3)])).await.unwrap();

    assert_eq!(h.stock("a"), 0);
    h.assert_consistent("a").await;
}

#[tokio::test]
async fn duplicate_reduce_changes_nothing() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;

    h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap();
    let replay = h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap();

    assert_eq!(
        replay,
        EngineOutcome::Duplicate {
            transaction_id: TransactionId::new("tx-1"),
            state: TransactionState::Applied,
        }
    );
    assert_eq!(h.stock("a"), 8);
}

#[tokio::test]
async fn insufficient_stock_rejects_the_whole_transaction() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 0)]).await;

    let err = h
        .engine
        .reduce(reduce("tx-1", &[("a", 3), ("b", 1)]))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        StockError::InsufficientStock {
            product_id: ProductId::new("b"),
            requested: 1,
            available: 0,
        }
    );
    assert_eq!(h.stock("a"), 10);
    assert_eq!(h.stock("b"), 0);

    let record = h.ledger.record(&TransactionId::new("tx-1")).unwrap();
    assert_eq!(record.state, TransactionState::Rejected);
    assert_eq!(record.rejection, err.rejection());
    assert!(!record.compensating);

    let kinds: Vec<AdjustmentKind> = h
        .products
        .receipts_for(&ProductId::new("a"), &TransactionId::new("tx-1"))
        .iter()
        .map(|receipt| receipt.kind)
        .collect();
    assert_eq!(kinds, vec![AdjustmentKind::Reduce, AdjustmentKind::Restore]);
    h.assert_consistent("a").await;
    h.assert_consistent("b").await;
}

#[tokio::test]
async fn unknown_product_rejects_and_compensates() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;

    let err = h
        .engine
        .reduce(reduce("tx-1", &[("a", 2), ("ghost", 1)]))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnknownProduct);
    assert_eq!(h.stock("a"), 10);
    assert_eq!(h.state("tx-1"), Some(TransactionState::Rejected));
}

#[tokio::test]
async fn replaying_a_rejected_reduce_reports_the_recorded_rejection() {
    let h = Harness::new();
    h.seed(&[("a", 1)]).await;

    let first = h.engine.reduce(reduce("tx-1", &[("a", 5)])).await.unwrap_err();
    h.engine.restock(TransactionId::new("r-1"), ProductId::new("a"), NonZeroU32::new(10).unwrap())
        .await
        .unwrap();
    let replay = h.engine.reduce(reduce("tx-1", &[("a", 5)])).await.unwrap_err();

    assert_eq!(first, replay);
    assert_eq!(h.stock("a"), 11);
}

#[tokio::test]
async fn redelivery_uses_the_recorded_lines() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 10)]).await;
    h.products.fail_adjustments_after(0);

    let err = h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);

    h.products.heal();
    h.engine.reduce(reduce("tx-1", &[("b", 7)])).await.unwrap();

    assert_eq!(h.stock("a"), 8);
    assert_eq!(h.stock("b"), 10);
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn rollback_restores_an_applied_transaction_once() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 5)]).await;
    h.engine.reduce(reduce("tx-1", &[("a", 2), ("b", 1)])).await.unwrap();

    let outcome = h.engine.rollback(rollback("tx-1")).await.unwrap();
    assert_eq!(
        outcome,
        EngineOutcome::RolledBack {
            transaction_id: TransactionId::new("tx-1")
        }
    );
    assert_eq!(h.stock("a"), 10);
    assert_eq!(h.stock("b"), 5);

    let replay = h.engine.rollback(rollback("tx-1")).await.unwrap();
    assert!(matches!(
        replay,
        EngineOutcome::Duplicate {
            state: TransactionState::RolledBack,
            ..
        }
    ));
    assert_eq!(h.stock("a"), 10);
    h.assert_consistent("a").await;
}

#[tokio::test]
async fn rollback_before_reduce_is_not_found() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;

    let err = h.engine.rollback(rollback("tx-1")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.kind().is_recoverable());
    assert_eq!(h.state("tx-1"), None);
}

#[tokio::test]
async fn rollback_of_a_rejected_transaction_is_a_no_op() {
    let h = Harness::new();
    h.seed(&[("a", 1)]).await;
    h.engine.reduce(reduce("tx-1", &[("a", 5)])).await.unwrap_err();

    let outcome = h.engine.rollback(rollback("tx-1")).await.unwrap();

    assert!(matches!(
        outcome,
        EngineOutcome::Duplicate {
            state: TransactionState::Rejected,
            ..
        }
    ));
    assert_eq!(h.stock("a"), 1);
}

#[tokio::test]
async fn reduce_after_rollback_is_a_duplicate() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;
    h.engine.reduce(reduce("tx-1", &[("a", 4)])).await.unwrap();
    h.engine.rollback(rollback("tx-1")).await.unwrap();

    let replay = h.engine.reduce(reduce("tx-1", &[("a", 4)])).await.unwrap();

    assert!(matches!(
        replay,
        EngineOutcome::Duplicate {
            state: TransactionState::RolledBack,
            ..
        }
    ));
    assert_eq!(h.stock("a"), 10);
}

#[tokio::test]
async fn interrupted_rollback_resumes_without_double_restore() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 10)]).await;
    h.engine.reduce(reduce("tx-1", &[("a", 2), ("b", 3)])).await.unwrap();
    h.products.fail_adjustments_after(1);

    let err = h.engine.rollback(rollback("tx-1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
    assert_eq!(h.stock("a"), 10);
    assert_eq!(h.stock("b"), 7);
    assert_eq!(h.state("tx-1"), Some(TransactionState::Applied));

    h.products.heal();
    h.engine.rollback(rollback("tx-1")).await.unwrap();
    assert_eq!(h.stock("a"), 10);
    assert_eq!(h.stock("b"), 10);
    assert_eq!(h.state("tx-1"), Some(TransactionState::RolledBack));
}

#[tokio::test]
async fn rollback_without_a_decrement_is_an_invariant_violation() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;
    let mut record = BeginTransaction {
        transaction_id: TransactionId::new("tx-1"),
        lines: vec![LedgerLine::new("a", 2)],
        now: test_epoch(),
        lease_until: test_epoch(),
    }
    .new_record();
    record.state = TransactionState::Applied;
    h.ledger.put(record);

    let err = h.engine.rollback(rollback("tx-1")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    assert_eq!(h.stock("a"), 10);
}

// ============================================================================
// Concurrency control and failures
// ============================================================================

#[tokio::test]
async fn version_conflicts_are_retried_with_a_fresh_read() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;
    h.products.interfere(&ProductId::new("a"), 3);

    h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap();

    assert_eq!(h.stock("a"), 8);
}

#[tokio::test]
async fn exhausted_conflicts_release_the_lease_for_redelivery() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;
    h.products.interfere(&ProductId::new("a"), 100);

    let err = h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.state("tx-1"), Some(TransactionState::Pending));

    h.products.heal();
    h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap();

    assert_eq!(h.stock("a"), 8);
    assert_eq!(h.ledger.record(&TransactionId::new("tx-1")).unwrap().lease.epoch, 2);
}

#[tokio::test]
async fn outage_mid_reduce_resumes_without_double_decrement() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 10)]).await;
    h.products.fail_adjustments_after(1);

    let err = h
        .engine
        .reduce(reduce("tx-1", &[("a", 2), ("b", 3)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
    assert_eq!(h.stock("a"), 8);
    assert_eq!(h.stock("b"), 10);

    h.products.heal();
    h.engine.reduce(reduce("tx-1", &[("a", 2), ("b", 3)])).await.unwrap();

    assert_eq!(h.stock("a"), 8);
    assert_eq!(h.stock("b"), 7);
    h.assert_consistent("a").await;
    h.assert_consistent("b").await;
}

#[tokio::test]
async fn live_lease_keeps_other_drivers_out() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;
    h.ledger.fail_releases(true);
    h.products.fail_adjustments_after(0);
    h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap_err();
    h.products.heal();

    let err = h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap_err();

    assert!(matches!(err, StockError::InFlight { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.stock("a"), 10);
}

#[tokio::test]
async fn recovery_sweep_finishes_a_crashed_reduce() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 10)]).await;
    h.ledger.fail_releases(true);
    h.products.fail_adjustments_after(1);
    h.engine
        .reduce(reduce("tx-1", &[("a", 2), ("b", 3)]))
        .await
        .unwrap_err();
    h.products.heal();

    let early = h.engine.recover_stalled(10).await.unwrap();
    assert_eq!(early.scanned, 0);

    h.clock.advance(chrono::Duration::seconds(31));
    let report = h.engine.recover_stalled(10).await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(h.stock("a"), 8);
    assert_eq!(h.stock("b"), 7);
    assert_eq!(h.state("tx-1"), Some(TransactionState::Applied));
}

#[tokio::test]
async fn recovery_sweep_rejects_a_stalled_reduce_that_no_longer_fits() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 1)]).await;
    let begun = h
        .ledger
        .begin(BeginTransaction {
            transaction_id: TransactionId::new("tx-1"),
            lines: vec![LedgerLine::new("a", 2), LedgerLine::new("b", 5)],
            now: test_epoch(),
            lease_until: test_epoch() + chrono::Duration::seconds(30),
        })
        .await
        .unwrap();
    assert!(matches!(begun, stock_reconciler_core::ledger::BeginOutcome::Started(_)));

    h.clock.advance(chrono::Duration::seconds(60));
    let report = h.engine.recover_stalled(10).await.unwrap();

    assert_eq!(report.rejected, 1);
    assert_eq!(h.stock("a"), 10);
    assert_eq!(h.stock("b"), 1);
}

#[tokio::test]
async fn recovery_sweep_finishes_compensation_of_a_rejected_reduce() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 0)]).await;
    h.products.fail_restores(true);

    // The reduce of `a` lands, `b` is short, and restoring `a` fails. If the delivery
    // is then given up on, only the ledger remembers that `a` is owed 2 units.
    let err = h
        .engine
        .reduce(reduce("tx-1", &[("a", 2), ("b", 1)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
    assert_eq!(h.stock("a"), 8);
    let record = h.ledger.record(&TransactionId::new("tx-1")).unwrap();
    assert_eq!(record.state, TransactionState::Rejected);
    assert!(record.compensating);

    h.products.heal();
    let early = h.engine.recover_stalled(100).await.unwrap();
    assert_eq!(early.scanned, 0);

    h.clock.advance(chrono::Duration::hours(1));
    let report = h.engine.recover_stalled(100).await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(h.stock("a"), 10);
    assert_eq!(h.stock("b"), 0);
    assert!(!h.ledger.record(&TransactionId::new("tx-1")).unwrap().compensating);
    h.assert_consistent("a").await;
    h.assert_consistent("b").await;

    let again = h.engine.recover_stalled(100).await.unwrap();
    assert_eq!(again.scanned, 0);
}

#[tokio::test]
async fn recovery_sweep_finishes_an_interrupted_rollback() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 10)]).await;
    h.engine.reduce(reduce("tx-1", &[("a", 2), ("b", 3)])).await.unwrap();
    h.products.fail_adjustments_after(1);

    let err = h.engine.rollback(rollback("tx-1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
    assert_eq!(h.stock("a"), 10);
    assert_eq!(h.stock("b"), 7);
    let record = h.ledger.record(&TransactionId::new("tx-1")).unwrap();
    assert_eq!(record.state, TransactionState::Applied);
    assert!(record.compensating);

    h.products.heal();
    let early = h.engine.recover_stalled(100).await.unwrap();
    assert_eq!(early.scanned, 0);

    h.clock.advance(chrono::Duration::hours(1));
    let report = h.engine.recover_stalled(100).await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.rolled_back, 1);
    assert_eq!(h.stock("a"), 10);
    assert_eq!(h.stock("b"), 10);
    let record = h.ledger.record(&TransactionId::new("tx-1")).unwrap();
    assert_eq!(record.state, TransactionState::RolledBack);
    assert!(!record.compensating);
    h.assert_consistent("a").await;
    h.assert_consistent("b").await;

    let duplicate = h.engine.rollback(rollback("tx-1")).await.unwrap();
    assert!(matches!(duplicate, EngineOutcome::Duplicate { state: TransactionState::RolledBack, .. }));
}

#[tokio::test]
async fn failed_resolve_is_healed_by_redelivery_after_the_lease() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;
    h.ledger.fail_next_resolves(5);

    let err = h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
    assert_eq!(h.stock("a"), 8);

    h.ledger.fail_next_resolves(0);
    h.clock.advance(chrono::Duration::seconds(31));
    h.engine.reduce(reduce("tx-1", &[("a", 2)])).await.unwrap();

    assert_eq!(h.stock("a"), 8);
    assert_eq!(h.state("tx-1"), Some(TransactionState::Applied));
}

#[tokio::test]
async fn late_decrement_from_a_stale_driver_is_absorbed() {
    let h = Harness::new();
    h.seed(&[("a", 10), ("b", 0)]).await;
    // A driver claimed the transaction under epoch 1 and went quiet.
    h.ledger
        .begin(BeginTransaction {
            transaction_id: TransactionId::new("tx-1"),
            lines: vec![LedgerLine::new("b", 1), LedgerLine::new("a", 2)],
            now: test_epoch(),
            lease_until: test_epoch() + chrono::Duration::seconds(30),
        })
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(31));

    let err = h
        .engine
        .reduce(reduce("tx-1", &[("b", 1), ("a", 2)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientStock);

    // The stale driver wakes up and decrements a line the new driver never reached.
    let level = h.products.load(ProductId::new("a")).await.unwrap();
    let late = h
        .products
        .conditional_adjust(AdjustStock {
            product_id: ProductId::new("a"),
            delta: -2,
            expected_version: level.version,
            transaction_id: TransactionId::new("tx-1"),
            kind: AdjustmentKind::Reduce,
        })
        .await
        .unwrap();

    assert!(matches!(late, AdjustOutcome::Compensated(_)));
    assert_eq!(h.stock("a"), 10);
    h.assert_consistent("a").await;
}

#[tokio::test(start_paused = true)]
async fn slow_store_calls_time_out_as_unavailable() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;
    h.products.set_latency(Some(Duration::from_secs(5)));

    let err = h.engine.stock_level(&ProductId::new("a")).await.unwrap_err();

    assert!(err.is_unavailable());
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
}

// ============================================================================
// Restock and audit
// ============================================================================

#[tokio::test]
async fn restock_is_keyed() {
    let h = Harness::new();
    h.seed(&[("a", 1)]).await;
    let quantity = NonZeroU32::new(5).unwrap();

    let first = h
        .engine
        .restock(TransactionId::new("r-1"), ProductId::new("a"), quantity)
        .await
        .unwrap();
    let second = h
        .engine
        .restock(TransactionId::new("r-1"), ProductId::new("a"), quantity)
        .await
        .unwrap();

    assert!(matches!(first, EngineOutcome::Restocked { replayed: false, .. }));
    assert!(matches!(second, EngineOutcome::Restocked { replayed: true, .. }));
    assert_eq!(h.stock("a"), 6);
}

#[tokio::test]
async fn restock_of_unknown_product_fails() {
    let h = Harness::new();

    let err = h
        .engine
        .restock(TransactionId::new("r-1"), ProductId::new("ghost"), NonZeroU32::new(1).unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnknownProduct);
}

#[tokio::test]
async fn audit_explains_stock_after_mixed_operations() {
    let h = Harness::new();
    h.seed(&[("a", 10)]).await;
    h.engine.reduce(reduce("tx-1", &[("a", 4)])).await.unwrap();
    h.engine.reduce(reduce("tx-2", &[("a", 40)])).await.unwrap_err();
    h.engine
        .restock(TransactionId::new("r-1"), ProductId::new("a"), NonZeroU32::new(3).unwrap())
        .await
        .unwrap();
    h.engine.rollback(rollback("tx-1")).await.unwrap();

    let audit = h.engine.audit(&ProductId::new("a")).await.unwrap();

    assert!(audit.is_consistent());
    assert_eq!(audit.recorded, 13);
    assert_eq!(audit.reconstructed, 13);
    // opening, reduce, void tombstone of the rejected reduce, restock, restore
    assert_eq!(audit.receipts, 5);
}

#[tokio::test]
async fn registering_a_product_twice_fails() {
    let h = Harness::new();
    h.seed(&[("a", 1)]).await;

    let err = h
        .engine
        .register_product(ProductId::new("a"), 1)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvariantViolation);
}

#[tokio::test]
async fn rejection_reason_is_recorded_on_the_ledger() {
    let h = Harness::new();
    h.seed(&[("a", 2)]).await;

    h.engine.reduce(reduce("tx-1", &[("a", 3)])).await.unwrap_err();

    let record = h.ledger.record(&TransactionId::new("tx-1")).unwrap();
    assert_eq!(
        record.rejection,
        Some(RejectionReason::InsufficientStock {
            product_id: ProductId::new("a"),
            requested: 3,
            available: 2,
        })
    );
    assert!(record.resolved_at.is_some());
}
