//! # Stock Reconciler Service
//!
//! Wiring for the `stock-reconciler` binary: configuration loading and the
//! conversion of that configuration into runtime settings.
//!
//! The binary connects the Postgres product store, transaction ledger and
//! dead-letter queue to a worker pool consuming the configured transport.
//! Building with `--features redpanda` enables the Kafka/Redpanda transport.

pub mod config;

pub use config::{Config, ConfigError};
