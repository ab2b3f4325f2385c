//! Stock reconciler service.
//!
//! Consumes order events and keeps product stock in step with them.

use anyhow::Context;
use std::sync::Arc;
use stock_reconciler_consumer::Config;
use stock_reconciler_consumer::config::RedpandaConfig;
use stock_reconciler_core::environment::{Clock, SystemClock};
use stock_reconciler_core::transport::MessageTransport;
use stock_reconciler_postgres::{
    DeadLetterQueue, PostgresProductStore, PostgresTransactionLedger, connect, migrate,
};
use stock_reconciler_runtime::metrics::MetricsServer;
use stock_reconciler_runtime::{EventIntake, StockEngine, WorkerPool};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "stock_reconciler=info,stock_reconciler_runtime=info,\
    stock_reconciler_postgres=info,stock_reconciler_redpanda=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting stock reconciler");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        brokers = %config.redpanda.brokers,
        topic = %config.redpanda.topic,
        consumer_group = %config.redpanda.consumer_group,
        concurrency = config.processing.concurrency,
        "Configuration loaded"
    );

    // Keep the server alive for the lifetime of the process.
    let _metrics = match config.metrics_addr {
        Some(addr) => {
            let mut server = MetricsServer::new(addr);
            server.start().context("Failed to start metrics server")?;
            Some(server)
        },
        None => None,
    };

    info!("Connecting to database...");
    let pool = connect(&config.database.url, &config.database.pool()).await?;
    migrate(&pool).await?;
    info!("Database ready");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(StockEngine::new(
        Arc::new(PostgresProductStore::new(pool.clone())),
        Arc::new(PostgresTransactionLedger::new(pool.clone())),
        Arc::clone(&clock),
        config.engine_config(),
    ));
    let intake = Arc::new(EventIntake::new(
        Arc::clone(&engine),
        Arc::new(DeadLetterQueue::new(pool.clone())),
        clock,
        config.intake_config(),
    ));
    let workers = WorkerPool::new(intake, engine, config.worker_config());

    let transport = build_transport(&config.redpanda)?;
    workers.run(transport.as_ref(), shutdown_signal()).await?;

    pool.close().await;
    info!("Stock reconciler stopped");
    Ok(())
}

#[cfg(feature = "redpanda")]
fn build_transport(config: &RedpandaConfig) -> anyhow::Result<Arc<dyn MessageTransport>> {
    let mut builder = stock_reconciler_redpanda::RedpandaTransport::builder()
        .brokers(&config.brokers)
        .topic(&config.topic)
        .consumer_group(&config.consumer_group);
    if let Some(topic) = &config.dead_letter_topic {
        builder = builder.dead_letter_topic(topic);
    }
    Ok(Arc::new(builder.build()?))
}

#[cfg(not(feature = "redpanda"))]
fn build_transport(_config: &RedpandaConfig) -> anyhow::Result<Arc<dyn MessageTransport>> {
    anyhow::bail!("No transport compiled in; rebuild with `--features redpanda`")
}

/// Wait for a shutdown signal.
///
/// Waits for:
/// - Ctrl+C (SIGINT)
/// - SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, finishing in-flight deliveries...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, finishing in-flight deliveries...");
        },
    }
}
