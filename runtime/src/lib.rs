//! # Stock Reconciler Runtime
//!
//! Runtime for reconciling product stock against order lifecycle events.
//!
//! This crate wires the core contracts together into a running consumer.
//!
//! ## Core Components
//!
//! - **Engine**: applies reduce, rollback and restock commands idempotently
//! - **Intake**: decodes deliveries and maps engine results to acknowledgments
//! - **Worker Pool**: consumes a transport concurrently and sweeps stalled transactions
//!
//! ## Example
//!
//! ```ignore
//! use stock_reconciler_runtime::{EngineConfig, EventIntake, IntakeConfig, StockEngine};
//!
//! let engine = Arc::new(StockEngine::new(products, ledger, clock.clone(), EngineConfig::default()));
//! let intake = EventIntake::new(engine, dead_letters, clock, IntakeConfig::default());
//!
//! // Decide how to settle one delivery
//! let ack = intake.handle(&payload, redelivery_count).await;
//! ```

/// Stock adjustment engine
pub mod engine;

/// Delivery decoding and settlement policy
pub mod intake;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Concurrent delivery processing
pub mod worker;

pub use engine::{EngineConfig, EngineOutcome, RecoveryReport, StockAudit, StockEngine};
pub use intake::{EventIntake, IntakeConfig};
pub use retry::{RetryError, RetryPolicy};
pub use worker::{WorkerConfig, WorkerPool};
