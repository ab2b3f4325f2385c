//! Message transport abstraction: at-least-once deliveries and their settlement.
//!
//! A [`MessageTransport`] hands out a stream of [`Delivery`] values. Each delivery is
//! settled exactly once with an [`Acknowledgment`]:
//!
//! - [`Acknowledgment::Ack`]: processing finished; never deliver again
//! - [`Acknowledgment::NackRequeue`]: deliver again after `delay`
//! - [`Acknowledgment::NackNoRequeue`]: never deliver again; route to the transport's
//!   dead-letter destination if it has one
//!
//! Transports guarantee at-least-once delivery only. Duplicate suppression is the
//! engine's job, keyed by transaction id.
//!
//! # Implementations
//!
//! - `RedpandaTransport` (in `stock-reconciler-redpanda`): Kafka-compatible production transport
//! - `InMemoryTransport` (in `stock-reconciler-testing`): queue with requeue semantics for tests

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors from transport operations.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Could not connect to the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Could not publish a message.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Could not subscribe.
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Could not settle (commit, requeue or dead-letter) a delivery.
    #[error("Settlement failed: {0}")]
    SettlementFailed(String),

    /// Failure while receiving.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// How a delivery should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgment {
    /// Done; remove from the queue.
    Ack,
    /// Redeliver after the given delay.
    NackRequeue {
        /// Backoff before the message becomes visible again.
        delay: Duration,
    },
    /// Done, but unsuccessfully; do not redeliver.
    NackNoRequeue,
}

impl Acknowledgment {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::NackRequeue { .. } => "nack_requeue",
            Self::NackNoRequeue => "nack_no_requeue",
        }
    }
}

/// Settles one delivery on the transport it came from.
///
/// Consumes itself so a delivery cannot be settled twice.
pub trait Acknowledger: Send {
    /// Apply the acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SettlementFailed`] if the transport rejected the
    /// settlement. The delivery will then be redelivered by the broker.
    fn settle(
        self: Box<Self>,
        ack: Acknowledgment,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;
}

/// One inbound message together with the handle that settles it.
pub struct Delivery {
    /// Raw message bytes.
    pub payload: Vec<u8>,
    /// How many times this message was requeued before.
    pub redelivery_count: u32,
    acknowledger: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery.
    #[must_use]
    pub fn new(payload: Vec<u8>, redelivery_count: u32, acknowledger: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            redelivery_count,
            acknowledger,
        }
    }

    /// Settle the delivery.
    ///
    /// # Errors
    ///
    /// See [`Acknowledger::settle`].
    pub async fn settle(self, ack: Acknowledgment) -> Result<(), TransportError> {
        self.acknowledger.settle(ack).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("redelivery_count", &self.redelivery_count)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

/// A topic-bound, at-least-once message transport.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the transport can be used as
/// `Arc<dyn MessageTransport>`.
pub trait MessageTransport: Send + Sync {
    /// Publish a payload. `key` selects the partition, so messages sharing a key
    /// (a reduce and its rollback) keep their relative order.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the broker refused the message.
    fn publish(
        &self,
        key: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Start consuming.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SubscriptionFailed`] if consumption cannot start.
    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, TransportError>> + Send + '_>>;
}
