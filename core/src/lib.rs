//! # Stock Reconciler Core
//!
//! Core traits and types for reconciling product stock against asynchronous order
//! lifecycle events.
//!
//! This crate defines the vocabulary shared by every other crate in the workspace:
//!
//! - [`product`]: product identity, stock levels and the conditional-update
//!   [`ProductStore`](product::ProductStore) contract
//! - [`ledger`]: transaction records, leases and the
//!   [`TransactionLedger`](ledger::TransactionLedger) contract
//! - [`command`]: the inbound `reduce_stock` / `rollback_stock` envelope codec
//! - [`error`]: the closed [`ErrorKind`](error::ErrorKind) taxonomy
//! - [`transport`]: at-least-once deliveries and their acknowledgments
//! - [`dead_letter`]: where permanently failed messages go
//! - [`environment`]: injected dependencies such as the clock
//!
//! ## Guarantees built on these types
//!
//! - A transaction's reduce is applied at most once in effect, however often its
//!   message is delivered.
//! - A reduce is all-or-nothing across its product lines.
//! - Stock is never negative in any committed state.
//! - A rollback restores exactly what its reduce took, at most once.

pub use chrono::{DateTime, Utc};

pub mod command;
pub mod dead_letter;
pub mod error;
pub mod ledger;
pub mod product;
pub mod transport;

/// Environment module - injected dependencies
///
/// All external dependencies of the engine are abstracted behind traits so tests can
/// substitute deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The engine reads the clock for ledger timestamps and lease expiry.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
