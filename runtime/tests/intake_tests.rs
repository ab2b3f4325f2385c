//! Integration tests for event intake and the worker pool
//!
//! Checks how every class of engine result is settled, and runs the pool end to
//! end over the in-memory transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::sync::Arc;
use std::time::Duration;
use stock_reconciler_core::error::ErrorKind;
use stock_reconciler_core::ledger::{BeginTransaction, LedgerLine, TransactionId, TransactionState};
use stock_reconciler_core::product::ProductId;
use stock_reconciler_core::transport::{Acknowledgment, MessageTransport};
use stock_reconciler_runtime::{
    EngineConfig, EventIntake, IntakeConfig, RetryPolicy, StockEngine, WorkerConfig, WorkerPool,
};
use stock_reconciler_testing::helpers::{
    event_payload, init_tracing, reduce_payload, rollback_payload,
};
use stock_reconciler_testing::{
    InMemoryDeadLetterSink, InMemoryProductStore, InMemoryTransactionLedger, InMemoryTransport,
    test_clock, test_epoch,
};

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    products: Arc<InMemoryProductStore>,
    ledger: Arc<InMemoryTransactionLedger>,
    dead_letters: Arc<InMemoryDeadLetterSink>,
    engine: Arc<StockEngine>,
    intake: Arc<EventIntake>,
}

impl Harness {
    async fn new(catalogue: &[(&str, u32)]) -> Self {
        Self::with_redeliveries(catalogue, 3).await
    }

    async fn with_redeliveries(catalogue: &[(&str, u32)], max_redeliveries: u32) -> Self {
        init_tracing();
        let clock = Arc::new(test_clock());
        let products = Arc::new(InMemoryProductStore::new());
        let ledger = Arc::new(InMemoryTransactionLedger::new());
        let dead_letters = Arc::new(InMemoryDeadLetterSink::new());

        let conflict_retry = RetryPolicy::builder()
            .max_retries(20)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build();
        let store_retry = RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build();
        let engine = Arc::new(StockEngine::new(
            products.clone(),
            ledger.clone(),
            clock.clone(),
            EngineConfig {
                conflict_retry,
                store_retry,
                call_timeout: Duration::from_millis(200),
                lease_ttl: Duration::from_secs(30),
            },
        ));
        let intake = Arc::new(EventIntake::new(
            engine.clone(),
            dead_letters.clone(),
            clock,
            IntakeConfig {
                redelivery_backoff: RetryPolicy::builder()
                    .initial_delay(Duration::from_millis(1))
                    .max_delay(Duration::from_millis(10))
                    .build(),
                max_redeliveries,
            },
        ));

        for (product, stock) in catalogue {
            engine
                .register_product(ProductId::new(*product), *stock)
                .await
                .unwrap();
        }

        Self {
            products,
            ledger,
            dead_letters,
            engine,
            intake,
        }
    }

    fn stock(&self, product: &str) -> i64 {
        self.products.stock(&ProductId::new(product)).unwrap()
    }
}

fn is_requeue(ack: Acknowledgment) -> bool {
    matches!(ack, Acknowledgment::NackRequeue { .. })
}

// ============================================================================
// Settlement mapping
// ============================================================================

#[tokio::test]
async fn malformed_json_is_acknowledged_and_dropped() {
    let h = Harness::new(&[]).await;

    let ack = h.intake.handle(b"{not json", 0).await;

    assert_eq!(ack, Acknowledgment::Ack);
    assert!(h.dead_letters.is_empty());
}

#[tokio::test]
async fn invalid_body_is_acknowledged_and_dropped() {
    let h = Harness::new(&[("a", 10)]).await;

    let zero = h.intake.handle(&reduce_payload("tx-1", &[("a", 0)]), 0).await;
    let missing = h
        .intake
        .handle(&event_payload("rollback_stock", &serde_json::json!({})), 0)
        .await;

    assert_eq!(zero, Acknowledgment::Ack);
    assert_eq!(missing, Acknowledgment::Ack);
    assert_eq!(h.stock("a"), 10);
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn unknown_event_is_discarded_without_requeue() {
    let h = Harness::new(&[]).await;

    let ack = h
        .intake
        .handle(&event_payload("restock", &serde_json::json!({ "transaction_id": "x" })), 0)
        .await;

    assert_eq!(ack, Acknowledgment::NackNoRequeue);
}

#[tokio::test]
async fn applied_and_duplicate_reduces_are_acknowledged() {
    let h = Harness::new(&[("a", 10)]).await;
    let payload = reduce_payload("tx-1", &[("a", 2), ("a", 1)]);

    assert_eq!(h.intake.handle(&payload, 0).await, Acknowledgment::Ack);
    assert_eq!(h.intake.handle(&payload, 1).await, Acknowledgment::Ack);

    assert_eq!(h.stock("a"), 7);
}

#[tokio::test]
async fn insufficient_stock_is_dead_lettered_then_acknowledged() {
    let h = Harness::new(&[("a", 1)]).await;
    let payload = reduce_payload("tx-1", &[("a", 5)]);

    let ack = h.intake.handle(&payload, 0).await;

    assert_eq!(ack, Acknowledgment::Ack);
    let letters = h.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].kind, ErrorKind::InsufficientStock);
    assert_eq!(letters[0].transaction_id, Some(TransactionId::new("tx-1")));
    assert_eq!(letters[0].event.as_deref(), Some("reduce_stock"));
    assert_eq!(letters[0].payload, payload);
    assert_eq!(letters[0].failed_at, test_epoch());
}

#[tokio::test]
async fn unknown_product_is_dead_lettered_then_acknowledged() {
    let h = Harness::new(&[]).await;

    let ack = h.intake.handle(&reduce_payload("tx-1", &[("ghost", 1)]), 0).await;

    assert_eq!(ack, Acknowledgment::Ack);
    assert_eq!(h.dead_letters.letters()[0].kind, ErrorKind::UnknownProduct);
}

#[tokio::test]
async fn failed_dead_letter_write_keeps_the_message() {
    let h = Harness::new(&[("a", 1)]).await;
    h.dead_letters.set_failing(true);
    let payload = reduce_payload("tx-1", &[("a", 5)]);

    let ack = h.intake.handle(&payload, 0).await;
    assert!(is_requeue(ack));

    h.dead_letters.set_failing(false);
    let ack = h.intake.handle(&payload, 1).await;
    assert_eq!(ack, Acknowledgment::Ack);
    assert_eq!(h.dead_letters.len(), 1);
    assert_eq!(h.stock("a"), 1);
}

#[tokio::test]
async fn rollback_before_reduce_is_requeued_with_backoff() {
    let h = Harness::new(&[("a", 10)]).await;

    let ack = h.intake.handle(&rollback_payload("tx-1"), 0).await;

    match ack {
        Acknowledgment::NackRequeue { delay } => assert!(delay <= Duration::from_millis(10)),
        other => panic!("expected requeue, got {other:?}"),
    }
    assert!(h.dead_letters.is_empty());
}

#[tokio::test]
async fn store_outage_is_requeued() {
    let h = Harness::new(&[("a", 10)]).await;
    h.products.set_unavailable(true);

    let ack = h.intake.handle(&reduce_payload("tx-1", &[("a", 1)]), 0).await;

    assert!(is_requeue(ack));
    assert!(h.dead_letters.is_empty());
}

#[tokio::test]
async fn exhausted_redelivery_budget_is_dead_lettered() {
    let h = Harness::new(&[("a", 10)]).await;

    let ack = h.intake.handle(&rollback_payload("tx-1"), 3).await;

    assert_eq!(ack, Acknowledgment::NackNoRequeue);
    let letters = h.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].kind, ErrorKind::NotFound);
    assert_eq!(letters[0].redelivery_count, 3);
}

#[tokio::test]
async fn invariant_violation_is_dead_lettered_without_requeue() {
    let h = Harness::new(&[("a", 10)]).await;
    let mut record = BeginTransaction {
        transaction_id: TransactionId::new("tx-1"),
        lines: vec![LedgerLine::new("a", 2)],
        now: test_epoch(),
        lease_until: test_epoch(),
    }
    .new_record();
    record.state = TransactionState::Applied;
    h.ledger.put(record);

    let ack = h.intake.handle(&rollback_payload("tx-1"), 0).await;

    assert_eq!(ack, Acknowledgment::NackNoRequeue);
    assert_eq!(h.dead_letters.letters()[0].kind, ErrorKind::InvariantViolation);
}

#[tokio::test]
async fn invariant_violation_is_requeued_while_it_cannot_be_dead_lettered() {
    let h = Harness::new(&[("a", 10)]).await;
    // Rejected without a reason: every replay reports an invariant violation.
    let mut record = BeginTransaction {
        transaction_id: TransactionId::new("tx-1"),
        lines: vec![LedgerLine::new("a", 2)],
        now: test_epoch(),
        lease_until: test_epoch(),
    }
    .new_record();
    record.state = TransactionState::Rejected;
    h.ledger.put(record);
    h.dead_letters.set_failing(true);
    let payload = reduce_payload("tx-1", &[("a", 2)]);

    let ack = h.intake.handle(&payload, 0).await;
    assert!(is_requeue(ack));
    assert!(h.dead_letters.is_empty());

    h.dead_letters.set_failing(false);
    let ack = h.intake.handle(&payload, 1).await;
    assert_eq!(ack, Acknowledgment::NackNoRequeue);
    assert_eq!(h.dead_letters.letters()[0].kind, ErrorKind::InvariantViolation);
    assert_eq!(h.stock("a"), 10);
}

// ============================================================================
// Worker pool
// ============================================================================

async fn run_until_idle(h: &Harness, transport: &InMemoryTransport, concurrency: usize) {
    let pool = WorkerPool::new(
        h.intake.clone(),
        h.engine.clone(),
        WorkerConfig {
            concurrency,
            recovery_interval: None,
            recovery_batch_size: 10,
        },
    );
    tokio::time::timeout(Duration::from_secs(10), pool.run(transport, transport.idle()))
        .await
        .expect("pool did not drain")
        .unwrap();
}

#[tokio::test]
async fn early_rollback_is_retried_until_its_reduce_lands() {
    let h = Harness::new(&[("a", 10)]).await;
    let transport = InMemoryTransport::new();
    transport.publish("tx-1", rollback_payload("tx-1")).await.unwrap();
    transport.publish("tx-1", reduce_payload("tx-1", &[("a", 4)])).await.unwrap();

    run_until_idle(&h, &transport, 1).await;

    assert_eq!(h.stock("a"), 10);
    assert_eq!(
        h.ledger.record(&TransactionId::new("tx-1")).unwrap().state,
        TransactionState::RolledBack
    );
    assert!(!transport.settled_as(Acknowledgment::NackRequeue { delay: Duration::ZERO }).is_empty());
    assert_eq!(transport.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_settles_a_mixed_workload() {
    let h = Harness::with_redeliveries(&[("a", 100), ("b", 100)], 50).await;
    let transport = InMemoryTransport::new();

    for i in 0..20 {
        let tx = format!("tx-{i}");
        transport
            .publish(&tx, reduce_payload(&tx, &[("a", 3), ("b", 2)]))
            .await
            .unwrap();
        // Every message is delivered twice
        transport
            .publish(&tx, reduce_payload(&tx, &[("a", 3), ("b", 2)]))
            .await
            .unwrap();
    }
    transport.publish("junk", b"junk".to_vec()).await.unwrap();

    run_until_idle(&h, &transport, 8).await;

    assert_eq!(h.stock("a"), 40);
    assert_eq!(h.stock("b"), 60);
    assert!(h.dead_letters.is_empty());
    assert!(h.engine.audit(&ProductId::new("a")).await.unwrap().is_consistent());
}
