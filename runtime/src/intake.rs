//! Event intake: decode a delivery, run it through the engine, decide how to settle it.
//!
//! | Engine result | Settlement |
//! |---|---|
//! | malformed envelope or body | `Ack` (logged, never retried) |
//! | unknown event type | `NackNoRequeue` |
//! | success or duplicate | `Ack` |
//! | `InsufficientStock` / `UnknownProduct` | dead-letter, then `Ack` |
//! | `Conflict` / `NotFound` / `TransportUnavailable` | `NackRequeue` with backoff; dead-letter and `NackNoRequeue` once the redelivery budget is spent |
//! | `AlreadyResolved` | `Ack` |
//! | `InvariantViolation` | dead-letter, then `NackNoRequeue` |
//!
//! A failed dead-letter write never loses a message: the delivery is requeued instead.

use crate::engine::StockEngine;
use crate::metrics::IntakeMetrics;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use stock_reconciler_core::command::StockCommand;
use stock_reconciler_core::dead_letter::{DeadLetter, DeadLetterSink};
use stock_reconciler_core::environment::Clock;
use stock_reconciler_core::error::{ErrorKind, StockError};
use stock_reconciler_core::transport::Acknowledgment;

/// Settlement policy of the intake.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Delay before a requeued delivery is seen again, by redelivery count.
    pub redelivery_backoff: RetryPolicy,
    /// Recoverable failures after this many redeliveries are dead-lettered.
    pub max_redeliveries: u32,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            redelivery_backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(30))
                .build(),
            max_redeliveries: 20,
        }
    }
}

/// Turns raw deliveries into engine calls and acknowledgments.
pub struct EventIntake {
    engine: Arc<StockEngine>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: IntakeConfig,
}

impl EventIntake {
    /// Create an intake.
    #[must_use]
    pub fn new(
        engine: Arc<StockEngine>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            engine,
            dead_letters,
            clock,
            config,
        }
    }

    /// Handle one delivery and decide how to settle it.
    pub async fn handle(&self, payload: &[u8], redelivery_count: u32) -> Acknowledgment {
        let command = match StockCommand::decode(payload) {
            Ok(command) => command,
            Err(err) if err.is_unknown_event() => {
                tracing::warn!(error = %err, "Discarding message with unknown event type");
                IntakeMetrics::record_delivery("unknown", Acknowledgment::NackNoRequeue);
                return Acknowledgment::NackNoRequeue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Discarding malformed message");
                IntakeMetrics::record_delivery("malformed", Acknowledgment::Ack);
                return Acknowledgment::Ack;
            }
        };

        let event = command.event_name();
        let ack = match self.engine.execute(command.clone()).await {
            Ok(outcome) => {
                tracing::debug!(
                    event,
                    transaction_id = %command.transaction_id(),
                    outcome = outcome.as_str(),
                    "Delivery processed"
                );
                Acknowledgment::Ack
            }
            Err(err) => self.on_failure(&command, payload, redelivery_count, err).await,
        };

        IntakeMetrics::record_delivery(event, ack);
        ack
    }

    async fn on_failure(
        &self,
        command: &StockCommand,
        payload: &[u8],
        redelivery_count: u32,
        err: StockError,
    ) -> Acknowledgment {
        let transaction_id = command.transaction_id();
        let kind = err.kind();

        match kind {
            ErrorKind::InsufficientStock | ErrorKind::UnknownProduct => {
                tracing::info!(transaction_id = %transaction_id, error = %err, "Reduce rejected");
                if self.dead_letter(command, payload, redelivery_count, &err).await {
                    Acknowledgment::Ack
                } else {
                    self.requeue(redelivery_count)
                }
            }
            ErrorKind::Conflict | ErrorKind::NotFound | ErrorKind::TransportUnavailable => {
                if redelivery_count < self.config.max_redeliveries {
                    tracing::debug!(
                        transaction_id = %transaction_id,
                        error = %err,
                        redelivery_count,
                        "Recoverable failure; requeueing"
                    );
                    return self.requeue(redelivery_count);
                }
                tracing::error!(
                    transaction_id = %transaction_id,
                    error = %err,
                    redelivery_count,
                    "Redelivery budget exhausted"
                );
                if self.dead_letter(command, payload, redelivery_count, &err).await {
                    Acknowledgment::NackNoRequeue
                } else {
                    self.requeue(redelivery_count)
                }
            }
            ErrorKind::AlreadyResolved => {
                tracing::debug!(transaction_id = %transaction_id, error = %err, "Transaction already resolved");
                Acknowledgment::Ack
            }
            ErrorKind::InvariantViolation => {
                tracing::error!(transaction_id = %transaction_id, error = %err, "Invariant violated; operator attention needed");
                if self.dead_letter(command, payload, redelivery_count, &err).await {
                    Acknowledgment::NackNoRequeue
                } else {
                    self.requeue(redelivery_count)
                }
            }
        }
    }

    fn requeue(&self, redelivery_count: u32) -> Acknowledgment {
        let attempt = usize::try_from(redelivery_count).unwrap_or(usize::MAX);
        Acknowledgment::NackRequeue {
            delay: self.config.redelivery_backoff.backoff(attempt),
        }
    }

    /// Returns whether the letter was stored.
    async fn dead_letter(
        &self,
        command: &StockCommand,
        payload: &[u8],
        redelivery_count: u32,
        err: &StockError,
    ) -> bool {
        let letter = DeadLetter {
            transaction_id: Some(command.transaction_id().clone()),
            event: Some(command.event_name().to_string()),
            payload: payload.to_vec(),
            kind: err.kind(),
            error_message: err.to_string(),
            redelivery_count,
            failed_at: self.clock.now(),
        };

        match self.dead_letters.send(letter).await {
            Ok(()) => {
                IntakeMetrics::record_dead_letter(err.kind());
                true
            }
            Err(sink_err) => {
                IntakeMetrics::record_dead_letter_failure();
                tracing::error!(
                    transaction_id = %command.transaction_id(),
                    error = %sink_err,
                    "Could not dead-letter message; keeping it alive"
                );
                false
            }
        }
    }
}
