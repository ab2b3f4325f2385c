//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for every stage of stock reconciliation:
//! - Engine commands (reduce, rollback, restock) and their outcomes
//! - Business rejections and optimistic-concurrency exhaustion
//! - Crash recovery sweeps
//! - Delivery settlement and dead-lettering
//!
//! # Example
//!
//! ```rust,no_run
//! use stock_reconciler_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use stock_reconciler_core::error::ErrorKind;
use stock_reconciler_core::transport::Acknowledgment;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime; the HTTP listener runs as a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or the listener cannot bind.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the server logs a
    /// warning and leaves [`handle`](Self::handle) unset.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        tokio::spawn(async move {
            // The exporter's error type implements neither Debug nor Display.
            if exporter.await.is_err() {
                tracing::error!(addr = %addr, "Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Engine Metrics
    describe_counter!(
        "stock_commands_total",
        "Engine commands processed, by command and outcome"
    );
    describe_histogram!(
        "stock_command_duration_seconds",
        "Time taken to process an engine command"
    );
    describe_counter!(
        "stock_rejections_total",
        "Reduces refused for a business reason"
    );
    describe_counter!(
        "stock_conflict_retries_exhausted_total",
        "Adjustments that gave up after repeated version conflicts"
    );
    describe_counter!(
        "stock_transactions_resumed_total",
        "Stalled transactions taken over from an expired lease"
    );
    describe_counter!(
        "stock_audit_mismatches_total",
        "Audits whose receipts disagree with the stored stock"
    );

    // Recovery Metrics
    describe_counter!(
        "stock_recovery_runs_total",
        "Recovery sweeps executed"
    );
    describe_counter!(
        "stock_recovery_transactions_total",
        "Stalled transactions handled by recovery sweeps, by result"
    );

    // Intake Metrics
    describe_counter!(
        "stock_deliveries_total",
        "Deliveries handled, by event and acknowledgment"
    );
    describe_counter!(
        "stock_dead_letters_total",
        "Messages dead-lettered, by error kind"
    );
    describe_counter!(
        "stock_dead_letter_failures_total",
        "Dead-letter writes that failed"
    );
}

/// Engine metrics recorder.
pub struct EngineMetrics;

impl EngineMetrics {
    /// Record a processed command.
    pub fn record_command(command: &'static str, outcome: &'static str, duration: Duration) {
        counter!("stock_commands_total", "command" => command, "outcome" => outcome).increment(1);
        histogram!("stock_command_duration_seconds", "command" => command)
            .record(duration.as_secs_f64());
    }

    /// Record a business rejection.
    pub fn record_rejection(kind: ErrorKind) {
        counter!("stock_rejections_total", "reason" => kind.as_str()).increment(1);
    }

    /// Record a conflict-retry budget running out.
    pub fn record_conflicts_exhausted() {
        counter!("stock_conflict_retries_exhausted_total").increment(1);
    }

    /// Record a stalled transaction being taken over.
    pub fn record_resumed() {
        counter!("stock_transactions_resumed_total").increment(1);
    }

    /// Record an audit mismatch.
    pub fn record_audit_mismatch() {
        counter!("stock_audit_mismatches_total").increment(1);
    }
}

/// Recovery sweep metrics recorder.
pub struct RecoveryMetrics;

impl RecoveryMetrics {
    /// Record a sweep.
    pub fn record_run() {
        counter!("stock_recovery_runs_total").increment(1);
    }

    /// Record one recovered transaction.
    pub fn record_transaction(result: &'static str) {
        counter!("stock_recovery_transactions_total", "result" => result).increment(1);
    }
}

/// Intake metrics recorder.
pub struct IntakeMetrics;

impl IntakeMetrics {
    /// Record how a delivery was settled.
    pub fn record_delivery(event: &'static str, ack: Acknowledgment) {
        counter!("stock_deliveries_total", "event" => event, "ack" => ack.as_str()).increment(1);
    }

    /// Record a dead letter.
    pub fn record_dead_letter(kind: ErrorKind) {
        counter!("stock_dead_letters_total", "kind" => kind.as_str()).increment(1);
    }

    /// Record a failed dead-letter write.
    pub fn record_dead_letter_failure() {
        counter!("stock_dead_letter_failures_total").increment(1);
    }
}
