//! Worker pool: consume deliveries concurrently, settle each one, sweep stalled
//! transactions on a timer.
//!
//! Deliveries are processed up to `concurrency` at a time; the engine's idempotency
//! and per-product conditional updates make any interleaving safe. On shutdown the
//! pool stops pulling new deliveries and waits for in-flight ones to settle.

use crate::engine::StockEngine;
use crate::intake::EventIntake;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use stock_reconciler_core::transport::{Delivery, MessageTransport, TransportError};
use tokio::time::MissedTickBehavior;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Deliveries processed at the same time.
    pub concurrency: usize,
    /// How often to sweep stalled transactions; `None` disables sweeping.
    pub recovery_interval: Option<Duration>,
    /// Most stalled transactions handled per sweep.
    pub recovery_batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            recovery_interval: Some(Duration::from_secs(30)),
            recovery_batch_size: 100,
        }
    }
}

/// Runs the intake over a transport's delivery stream.
pub struct WorkerPool {
    intake: Arc<EventIntake>,
    engine: Arc<StockEngine>,
    config: WorkerConfig,
}

impl WorkerPool {
    /// Create a pool.
    #[must_use]
    pub fn new(intake: Arc<EventIntake>, engine: Arc<StockEngine>, config: WorkerConfig) -> Self {
        Self {
            intake,
            engine,
            config,
        }
    }

    /// Consume until the stream ends or `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the subscription cannot be started.
    pub async fn run<S>(&self, transport: &dyn MessageTransport, shutdown: S) -> Result<(), TransportError>
    where
        S: Future<Output = ()> + Send,
    {
        let deliveries = transport.subscribe().await?;
        let concurrency = self.config.concurrency.max(1);
        tracing::info!(concurrency, "Worker pool started");

        let intake = &self.intake;
        let processing = deliveries
            .take_until(shutdown)
            .for_each_concurrent(concurrency, |item| async move {
                match item {
                    Ok(delivery) => process(intake, delivery).await,
                    Err(err) => tracing::warn!(error = %err, "Failed to receive delivery"),
                }
            });

        tokio::select! {
            () = processing => {}
            () = self.recovery_loop() => {}
        }

        tracing::info!("Worker pool stopped");
        Ok(())
    }

    async fn recovery_loop(&self) {
        let Some(period) = self.config.recovery_interval else {
            return std::future::pending().await;
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; let deliveries go first.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(err) = self
                .engine
                .recover_stalled(self.config.recovery_batch_size)
                .await
            {
                tracing::warn!(error = %err, "Recovery sweep failed");
            }
        }
    }
}

async fn process(intake: &EventIntake, delivery: Delivery) {
    let ack = intake
        .handle(&delivery.payload, delivery.redelivery_count)
        .await;
    if let Err(err) = delivery.settle(ack).await {
        tracing::warn!(error = %err, ack = ack.as_str(), "Failed to settle delivery; it will be redelivered");
    }
}
