//! Dead-letter sink for messages the engine permanently gave up on.

use crate::error::ErrorKind;
use crate::ledger::TransactionId;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A message that will not be processed further, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Transaction the message concerned, when it could be decoded.
    pub transaction_id: Option<TransactionId>,
    /// Event-type tag, when it could be decoded.
    pub event: Option<String>,
    /// Original message bytes.
    pub payload: Vec<u8>,
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Human-readable error.
    pub error_message: String,
    /// How many times the message had been redelivered.
    pub redelivery_count: u32,
    /// When the message was given up on.
    pub failed_at: DateTime<Utc>,
}

/// Errors from dead-letter sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// The sink could not store the letter.
    #[error("Dead-letter write failed: {0}")]
    WriteFailed(String),
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Store a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::WriteFailed`] if the letter was not stored; the
    /// caller must then keep the message alive.
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}
