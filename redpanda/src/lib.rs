//! Redpanda transport for the stock reconciler.
//!
//! [`RedpandaTransport`] implements [`MessageTransport`] over any Kafka-compatible
//! broker (Redpanda, Apache Kafka, MSK) using rdkafka.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - An offset is committed only after its delivery was settled, and only once every
//!   earlier offset on the same partition was settled too
//! - If the process crashes before commit, messages are redelivered
//! - Messages keyed by transaction id land on one partition, so a reduce and its
//!   rollback keep their publish order
//!
//! # Settlement
//!
//! Kafka has no per-message requeue, so settlement is layered on top of the log:
//!
//! | Acknowledgment  | Effect                                                                   |
//! |-----------------|--------------------------------------------------------------------------|
//! | `Ack`           | commit                                                                   |
//! | `NackRequeue`   | after `delay`, republish with `x-redelivery-count` + 1, then commit      |
//! | `NackNoRequeue` | publish to the dead-letter topic (if configured), then commit            |
//!
//! A requeue that fails to republish is left uncommitted; the partition's commit point
//! stalls behind it and the message comes back after the next restart or rebalance.
//!
//! # Example
//!
//! ```no_run
//! use stock_reconciler_redpanda::RedpandaTransport;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedpandaTransport::builder()
//!     .brokers("localhost:9092")
//!     .topic("stock-events")
//!     .consumer_group("stock-reconciler")
//!     .dead_letter_topic("stock-events-dlq")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod offsets;

pub use offsets::OffsetTracker;

use futures::StreamExt;
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use stock_reconciler_core::transport::{
    Acknowledger, Acknowledgment, Delivery, DeliveryStream, MessageTransport, TransportError,
};

/// Header carrying how many times a message was requeued.
pub const REDELIVERY_COUNT_HEADER: &str = "x-redelivery-count";

/// Read the redelivery count from a header value. Missing or garbled values count as
/// a first delivery.
#[must_use]
pub fn parse_redelivery_count(value: Option<&[u8]>) -> u32 {
    value
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

fn redelivery_count_of<M: Message>(message: &M) -> u32 {
    let value = message.headers().and_then(|headers| {
        headers
            .iter()
            .find(|header| header.key == REDELIVERY_COUNT_HEADER)
            .and_then(|header| header.value)
    });
    parse_redelivery_count(value)
}

/// Producer side, shared by `publish` and every acknowledger.
struct Outbound {
    producer: FutureProducer,
    topic: String,
    dead_letter_topic: Option<String>,
    timeout: Duration,
}

impl Outbound {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        redelivery_count: u32,
    ) -> Result<(), TransportError> {
        let count = redelivery_count.to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: REDELIVERY_COUNT_HEADER,
            value: Some(count.as_str()),
        });
        let mut record = FutureRecord::<str, [u8]>::to(topic)
            .payload(payload)
            .headers(headers);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    redelivery_count = redelivery_count,
                    "Message published"
                );
                Ok(())
            },
            Err((kafka_error, _)) => {
                tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
                Err(TransportError::PublishFailed {
                    topic: topic.to_string(),
                    reason: kafka_error.to_string(),
                })
            },
        }
    }
}

/// Consumer side of one subscription.
struct Inbound {
    consumer: StreamConsumer,
    offsets: Mutex<OffsetTracker>,
}

impl Inbound {
    fn commit_settled(&self, topic: &str, partition: i32, offset: i64) -> Result<(), TransportError> {
        let next = self
            .offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settle(partition, offset);
        let Some(next) = next else {
            return Ok(());
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next))
            .and_then(|()| self.consumer.commit(&tpl, CommitMode::Async))
            .map_err(|e| {
                TransportError::SettlementFailed(format!(
                    "Failed to commit {topic}/{partition}@{next}: {e}"
                ))
            })?;

        tracing::trace!(topic = %topic, partition = partition, offset = next, "Offset committed");
        Ok(())
    }
}

/// Kafka-compatible [`MessageTransport`].
///
/// Cheap to share behind an `Arc`; each [`subscribe`](MessageTransport::subscribe)
/// call creates its own consumer in the configured group.
pub struct RedpandaTransport {
    outbound: Arc<Outbound>,
    brokers: String,
    consumer_group: String,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaTransport {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaTransportBuilder {
        RedpandaTransportBuilder::default()
    }

    /// The configured brokers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// The topic events are consumed from and requeued onto.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.outbound.topic
    }
}

/// Builder for [`RedpandaTransport`].
#[derive(Debug, Default)]
pub struct RedpandaTransportBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    dead_letter_topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaTransportBuilder {
    /// Comma-separated broker list (required).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Topic carrying stock events (required).
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Consumer group. Defaults to `stock-reconciler-{topic}`.
    ///
    /// Instances sharing a group split the topic's partitions between them.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Topic that receives `NackNoRequeue` messages. Without one they are dropped
    /// after commit (the intake has already written its own dead letter).
    #[must_use]
    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Producer acks: "0", "1" or "all" (default: "all").
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression: "none", "gzip", "snappy", "lz4" or "zstd" (default: "none").
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Publish timeout (default: 5 seconds).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deliveries buffered between the consumer task and the stream (default: 1000).
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where a new consumer group starts: "earliest" or "latest" (default: "earliest").
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if brokers or topic are missing,
    /// or the producer cannot be created.
    pub fn build(self) -> Result<RedpandaTransport, TransportError> {
        let brokers = self
            .brokers
            .ok_or_else(|| TransportError::ConnectionFailed("Brokers not configured".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| TransportError::ConnectionFailed("Topic not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("compression.type", &compression)
            .create()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| format!("stock-reconciler-{topic}"));
        let buffer_size = self.buffer_size.unwrap_or(1000);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            consumer_group = %consumer_group,
            dead_letter_topic = ?self.dead_letter_topic,
            acks = %acks,
            compression = %compression,
            buffer_size = buffer_size,
            "RedpandaTransport created"
        );

        Ok(RedpandaTransport {
            outbound: Arc::new(Outbound {
                producer,
                topic,
                dead_letter_topic: self.dead_letter_topic,
                timeout,
            }),
            brokers,
            consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

impl MessageTransport for RedpandaTransport {
    fn publish(
        &self,
        key: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.outbound
                .produce(&self.outbound.topic, Some(key.as_str()), &payload, 0)
                .await
        })
    }

    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let topic = self.outbound.topic.clone();
            let subscription_failed = |reason: String| TransportError::SubscriptionFailed {
                topic: topic.clone(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;
            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

            tracing::info!(
                topic = %topic,
                consumer_group = %self.consumer_group,
                auto_offset_reset = %self.auto_offset_reset,
                buffer_size = self.buffer_size,
                "Subscribed"
            );

            let inbound = Arc::new(Inbound {
                consumer,
                offsets: Mutex::new(OffsetTracker::new()),
            });
            let outbound = Arc::clone(&self.outbound);
            let (tx, rx) = tokio::sync::mpsc::channel(self.buffer_size);

            tokio::spawn(async move {
                let mut stream = inbound.consumer.stream();

                while let Some(result) = stream.next().await {
                    let delivery = match result {
                        Ok(message) => {
                            let partition = message.partition();
                            let offset = message.offset();
                            inbound
                                .offsets
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .track(partition, offset);

                            let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                            let redelivery_count = redelivery_count_of(&message);
                            tracing::trace!(
                                partition = partition,
                                offset = offset,
                                redelivery_count = redelivery_count,
                                "Received message"
                            );

                            let acknowledger = KafkaAcknowledger {
                                inbound: Arc::clone(&inbound),
                                outbound: Arc::clone(&outbound),
                                partition,
                                offset,
                                key: message
                                    .key()
                                    .map(|key| String::from_utf8_lossy(key).into_owned()),
                                payload: payload.clone(),
                                redelivery_count,
                            };
                            Ok(Delivery::new(payload, redelivery_count, Box::new(acknowledger)))
                        },
                        Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
                    };

                    if tx.send(delivery).await.is_err() {
                        tracing::debug!("Delivery receiver dropped, exiting consumer task");
                        break;
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Settles one Kafka message.
struct KafkaAcknowledger {
    inbound: Arc<Inbound>,
    outbound: Arc<Outbound>,
    partition: i32,
    offset: i64,
    key: Option<String>,
    payload: Vec<u8>,
    redelivery_count: u32,
}

impl KafkaAcknowledger {
    fn commit(&self) -> Result<(), TransportError> {
        self.inbound
            .commit_settled(&self.outbound.topic, self.partition, self.offset)
    }

    async fn requeue(self, delay: Duration) {
        tokio::time::sleep(delay).await;
        let next_count = self.redelivery_count.saturating_add(1);
        let published = self
            .outbound
            .produce(&self.outbound.topic, self.key.as_deref(), &self.payload, next_count)
            .await;

        match published.and_then(|()| self.commit()) {
            Ok(()) => {
                metrics::counter!("stock_transport_requeues_total").increment(1);
            },
            Err(error) => {
                tracing::warn!(
                    partition = self.partition,
                    offset = self.offset,
                    error = %error,
                    "Requeue failed, message left uncommitted"
                );
            },
        }
    }

    async fn dead_letter(&self) -> Result<(), TransportError> {
        let Some(topic) = self.outbound.dead_letter_topic.as_deref() else {
            return Ok(());
        };
        self.outbound
            .produce(topic, self.key.as_deref(), &self.payload, self.redelivery_count)
            .await
            .map_err(|e| TransportError::SettlementFailed(e.to_string()))?;
        metrics::counter!("stock_transport_dead_lettered_total").increment(1);
        Ok(())
    }
}

impl Acknowledger for KafkaAcknowledger {
    fn settle(
        self: Box<Self>,
        ack: Acknowledgment,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>> {
        Box::pin(async move {
            match ack {
                Acknowledgment::Ack => self.commit(),
                Acknowledgment::NackRequeue { delay } => {
                    // The worker is free as soon as the requeue is scheduled.
                    tokio::spawn((*self).requeue(delay));
                    Ok(())
                },
                Acknowledgment::NackNoRequeue => {
                    self.dead_letter().await?;
                    self.commit()
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_transport_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaTransport>();
        assert_sync::<RedpandaTransport>();
        assert_send::<KafkaAcknowledger>();
    }

    #[test]
    fn builder_requires_brokers() {
        let result = RedpandaTransport::builder().topic("stock-events").build();
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[test]
    fn builder_requires_topic() {
        let result = RedpandaTransport::builder().brokers("localhost:9092").build();
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[test]
    fn builder_defaults_consumer_group_from_topic() {
        // Creating a producer does not contact the broker.
        let Ok(transport) = RedpandaTransport::builder()
            .brokers("localhost:9092")
            .topic("stock-events")
            .build()
        else {
            return;
        };
        assert_eq!(transport.consumer_group, "stock-reconciler-stock-events");
        assert_eq!(transport.topic(), "stock-events");
        assert_eq!(transport.brokers(), "localhost:9092");
    }

    #[test]
    fn redelivery_count_header_parsing() {
        assert_eq!(parse_redelivery_count(None), 0);
        assert_eq!(parse_redelivery_count(Some(b"3")), 3);
        assert_eq!(parse_redelivery_count(Some(b" 12 ")), 12);
        assert_eq!(parse_redelivery_count(Some(b"-1")), 0);
        assert_eq!(parse_redelivery_count(Some(b"three")), 0);
        assert_eq!(parse_redelivery_count(Some(&[0xff, 0xfe])), 0);
    }
}
