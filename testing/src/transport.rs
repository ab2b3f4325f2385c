//! In-memory at-least-once transport.
//!
//! Published payloads are queued on an unbounded channel. A `NackRequeue`
//! settlement puts the payload back after its delay with the redelivery count
//! incremented; `Ack` and `NackNoRequeue` remove it for good. Every settlement is
//! recorded for assertions.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stock_reconciler_core::transport::{
    Acknowledger, Acknowledgment, Delivery, DeliveryStream, MessageTransport, TransportError,
};
use tokio::sync::{Notify, mpsc};

/// One recorded settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Routing key the payload was published under.
    pub key: String,
    /// The settled payload.
    pub payload: Vec<u8>,
    /// Redelivery count of the settled delivery.
    pub redelivery_count: u32,
    /// How it was settled.
    pub ack: Acknowledgment,
}

#[derive(Debug)]
struct Queued {
    key: String,
    payload: Vec<u8>,
    redelivery_count: u32,
}

#[derive(Debug)]
struct Inner {
    sender: mpsc::UnboundedSender<Queued>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Queued>>>,
    settlements: Mutex<Vec<Settlement>>,
    outstanding: AtomicUsize,
    idle: Notify,
}

/// Single-subscriber queue with requeue semantics.
///
/// # Example
///
/// ```
/// use stock_reconciler_testing::InMemoryTransport;
/// use stock_reconciler_core::transport::MessageTransport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = InMemoryTransport::new();
/// transport.publish("order-1", b"{}".to_vec()).await?;
/// assert_eq!(transport.outstanding(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: Mutex::new(Some(receiver)),
                settlements: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Every settlement so far, in settlement order.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.settlements.lock().unwrap().clone()
    }

    /// Settlements matching `ack`'s variant (delays are ignored).
    #[must_use]
    pub fn settled_as(&self, ack: Acknowledgment) -> Vec<Settlement> {
        self.settlements()
            .into_iter()
            .filter(|settlement| {
                std::mem::discriminant(&settlement.ack) == std::mem::discriminant(&ack)
            })
            .collect()
    }

    /// Published payloads not yet acked or discarded.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Resolves once every published payload has been acked or discarded.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageTransport for InMemoryTransport {
    fn publish(
        &self,
        key: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let queued = Queued {
            key: key.to_string(),
            payload,
            redelivery_count: 0,
        };
        Box::pin(async move {
            self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
            self.inner
                .sender
                .send(queued)
                .map_err(|e| TransportError::PublishFailed {
                    topic: "in-memory".to_string(),
                    reason: e.to_string(),
                })
        })
    }

    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut receiver = self.inner.receiver.lock().unwrap().take().ok_or_else(|| {
                TransportError::SubscriptionFailed {
                    topic: "in-memory".to_string(),
                    reason: "already subscribed".to_string(),
                }
            })?;
            let inner = Arc::clone(&self.inner);

            let stream = async_stream::stream! {
                while let Some(queued) = receiver.recv().await {
                    let acknowledger = InMemoryAcknowledger {
                        inner: Arc::clone(&inner),
                        key: queued.key,
                        payload: queued.payload.clone(),
                        redelivery_count: queued.redelivery_count,
                    };
                    yield Ok::<_, TransportError>(Delivery::new(
                        queued.payload,
                        queued.redelivery_count,
                        Box::new(acknowledger),
                    ));
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

struct InMemoryAcknowledger {
    inner: Arc<Inner>,
    key: String,
    payload: Vec<u8>,
    redelivery_count: u32,
}

impl Acknowledger for InMemoryAcknowledger {
    fn settle(
        self: Box<Self>,
        ack: Acknowledgment,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>> {
        Box::pin(async move {
            let Self {
                inner,
                key,
                payload,
                redelivery_count,
            } = *self;

            inner.settlements.lock().unwrap().push(Settlement {
                key: key.clone(),
                payload: payload.clone(),
                redelivery_count,
                ack,
            });

            match ack {
                Acknowledgment::NackRequeue { delay } => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        // The receiver only goes away with the transport itself.
                        let _ = inner.sender.send(Queued {
                            key,
                            payload,
                            redelivery_count: redelivery_count + 1,
                        });
                    });
                }
                Acknowledgment::Ack | Acknowledgment::NackNoRequeue => {
                    if inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                        inner.idle.notify_waiters();
                    }
                }
            }
            Ok(())
        })
    }
}
