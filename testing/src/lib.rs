//! # Stock Reconciler Testing
//!
//! Testing utilities and helpers for the stock reconciler.
//!
//! This crate provides:
//! - In-memory implementations of every core contract, with fault injection
//! - Deterministic clocks
//! - Payload builders for `reduce_stock` / `rollback_stock` envelopes
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use stock_reconciler_testing::{InMemoryProductStore, InMemoryTransactionLedger, test_clock};
//!
//! #[tokio::test]
//! async fn reduce_is_idempotent() {
//!     let products = Arc::new(InMemoryProductStore::new());
//!     let ledger = Arc::new(InMemoryTransactionLedger::new());
//!     let engine = StockEngine::new(products.clone(), ledger, Arc::new(test_clock()), EngineConfig::default());
//!
//!     engine.reduce(order.clone()).await?;
//!     engine.reduce(order).await?;
//!     assert_eq!(products.stock(&product_id), Some(8));
//! }
//! ```

use chrono::{DateTime, Utc};
use stock_reconciler_core::environment::Clock;

mod dead_letter;
mod ledger;
mod product_store;
mod transport;

pub use dead_letter::InMemoryDeadLetterSink;
pub use ledger::InMemoryTransactionLedger;
pub use product_store::InMemoryProductStore;
pub use transport::{InMemoryTransport, Settlement};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use stock_reconciler_testing::mocks::FixedClock;
    /// use stock_reconciler_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to; used to expire leases.
    ///
    /// Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock reading `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        ///
        /// # Panics
        ///
        /// Panics if another test thread panicked while holding the clock.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// 2025-01-01 00:00:00 UTC.
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

/// Test helpers and utilities
///
/// Builders for the envelopes the order service publishes. Quantities are raw
/// integers so invalid input can be produced too.
pub mod helpers {
    use serde_json::json;

    /// A `reduce_stock` envelope.
    #[must_use]
    pub fn reduce_payload(transaction_id: &str, lines: &[(&str, i64)]) -> Vec<u8> {
        let products: Vec<_> = lines
            .iter()
            .map(|(product_id, quantity)| json!({ "product_id": product_id, "quantity": quantity }))
            .collect();
        json!({
            "event": "reduce_stock",
            "data": { "transaction_id": transaction_id, "products": products },
        })
        .to_string()
        .into_bytes()
    }

    /// A `rollback_stock` envelope.
    #[must_use]
    pub fn rollback_payload(transaction_id: &str) -> Vec<u8> {
        json!({
            "event": "rollback_stock",
            "data": { "transaction_id": transaction_id },
        })
        .to_string()
        .into_bytes()
    }

    /// An envelope with an arbitrary event tag.
    #[must_use]
    pub fn event_payload(event: &str, data: &serde_json::Value) -> Vec<u8> {
        json!({ "event": event, "data": data }).to_string().into_bytes()
    }

    /// Install a test subscriber honouring `RUST_LOG`; safe to call repeatedly.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities
///
/// Strategies over the small product catalogues the engine tests use.
pub mod properties {
    use proptest::prelude::*;

    /// One step of a random workload against a catalogue of `products` products.
    #[derive(Debug, Clone)]
    pub enum Step {
        /// Reduce transaction `tx` by `(product index, quantity)` lines.
        Reduce {
            /// Transaction number.
            tx: u8,
            /// Lines as `(product index, quantity)`.
            lines: Vec<(usize, u32)>,
        },
        /// Roll back transaction `tx`.
        Rollback {
            /// Transaction number.
            tx: u8,
        },
        /// Restock a product.
        Restock {
            /// Product index.
            product: usize,
            /// Units added.
            quantity: u32,
        },
    }

    /// Reduce lines over `products` products, quantities `1..=max_quantity`.
    pub fn lines(products: usize, max_quantity: u32) -> impl Strategy<Value = Vec<(usize, u32)>> {
        prop::collection::vec((0..products, 1..=max_quantity), 1..=products)
    }

    /// A workload step. Transaction numbers are drawn from a small range so that
    /// duplicates and rollbacks hit existing transactions.
    pub fn step(products: usize, max_quantity: u32) -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => (0u8..8, lines(products, max_quantity))
                .prop_map(|(tx, lines)| Step::Reduce { tx, lines }),
            2 => (0u8..8).prop_map(|tx| Step::Rollback { tx }),
            1 => (0..products, 1..=max_quantity)
                .prop_map(|(product, quantity)| Step::Restock { product, quantity }),
        ]
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock, test_epoch};
