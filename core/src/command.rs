//! Typed stock commands and their wire envelope.
//!
//! Inbound messages are JSON envelopes carrying an event-type tag and an opaque body:
//!
//! ```json
//! { "event": "reduce_stock", "data": { "transaction_id": "order-1", "products": [
//!     { "product_id": "sku-1", "quantity": 2 } ] } }
//! { "event": "rollback_stock", "data": { "transaction_id": "order-1" } }
//! ```
//!
//! Decoding validates everything the engine relies on: non-empty identifiers, at least
//! one line, and quantities of at least one. Repeated product lines are coalesced by
//! summing their quantities, keeping the order of first occurrence.

use crate::ledger::{LedgerLine, TransactionId};
use crate::product::ProductId;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Event-type tag of a reduce command.
pub const REDUCE_STOCK: &str = "reduce_stock";

/// Event-type tag of a rollback command.
pub const ROLLBACK_STOCK: &str = "rollback_stock";

/// Errors raised while decoding an inbound message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes are not a `{event, data}` envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope's event-type tag is not one this service handles.
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    /// The body does not match the command's shape.
    #[error("Malformed {event} body: {reason}")]
    MalformedBody {
        /// The event-type tag.
        event: String,
        /// What was wrong.
        reason: String,
    },
}

impl DecodeError {
    /// `true` when the tag was understood to be foreign rather than the body broken.
    #[must_use]
    pub const fn is_unknown_event(&self) -> bool {
        matches!(self, Self::UnknownEvent(_))
    }
}

/// Decrement stock for every line of a placed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceStock {
    /// Idempotency key.
    pub transaction_id: TransactionId,
    /// Distinct product lines in first-occurrence order.
    pub lines: Vec<LedgerLine>,
}

/// Reverse a previously applied reduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackStock {
    /// Transaction to reverse.
    pub transaction_id: TransactionId,
}

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockCommand {
    /// See [`ReduceStock`].
    Reduce(ReduceStock),
    /// See [`RollbackStock`].
    Rollback(RollbackStock),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    data: Box<RawValue>,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, T> {
    event: &'a str,
    data: T,
}

#[derive(Serialize, Deserialize)]
struct LineBody {
    product_id: String,
    quantity: i64,
}

#[derive(Serialize, Deserialize)]
struct ReduceBody {
    transaction_id: String,
    products: Vec<LineBody>,
}

#[derive(Serialize, Deserialize)]
struct RollbackBody {
    transaction_id: String,
}

impl StockCommand {
    /// Decode an envelope into a validated command.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::MalformedEnvelope`] if the bytes are not an envelope
    /// - [`DecodeError::UnknownEvent`] for an unhandled event-type tag
    /// - [`DecodeError::MalformedBody`] if the body is missing fields or fails validation
    ///
    /// # Examples
    ///
    /// ```
    /// use stock_reconciler_core::command::StockCommand;
    ///
    /// let payload = br#"{"event":"rollback_stock","data":{"transaction_id":"order-1"}}"#;
    /// let command = StockCommand::decode(payload).unwrap();
    /// assert_eq!(command.transaction_id().as_str(), "order-1");
    /// ```
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::MalformedEnvelope(e.to_string()))?;

        match envelope.event.as_str() {
            REDUCE_STOCK => {
                let body: ReduceBody = parse_body(REDUCE_STOCK, &envelope.data)?;
                Ok(Self::Reduce(ReduceStock {
                    transaction_id: parse_transaction_id(REDUCE_STOCK, &body.transaction_id)?,
                    lines: coalesce_lines(body.products)?,
                }))
            }
            ROLLBACK_STOCK => {
                let body: RollbackBody = parse_body(ROLLBACK_STOCK, &envelope.data)?;
                Ok(Self::Rollback(RollbackStock {
                    transaction_id: parse_transaction_id(ROLLBACK_STOCK, &body.transaction_id)?,
                }))
            }
            _ => Err(DecodeError::UnknownEvent(envelope.event)),
        }
    }

    /// Encode the command as an envelope, the way the order service publishes it.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let encoded = match self {
            Self::Reduce(reduce) => serde_json::to_vec(&OutboundEnvelope {
                event: REDUCE_STOCK,
                data: ReduceBody {
                    transaction_id: reduce.transaction_id.to_string(),
                    products: reduce
                        .lines
                        .iter()
                        .map(|line| LineBody {
                            product_id: line.product_id.to_string(),
                            quantity: i64::from(line.quantity),
                        })
                        .collect(),
                },
            }),
            Self::Rollback(rollback) => serde_json::to_vec(&OutboundEnvelope {
                event: ROLLBACK_STOCK,
                data: RollbackBody {
                    transaction_id: rollback.transaction_id.to_string(),
                },
            }),
        };
        // Plain structs of strings and integers always serialize.
        encoded.unwrap_or_default()
    }

    /// The event-type tag this command travels under.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Reduce(_) => REDUCE_STOCK,
            Self::Rollback(_) => ROLLBACK_STOCK,
        }
    }

    /// The command's idempotency key.
    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        match self {
            Self::Reduce(reduce) => &reduce.transaction_id,
            Self::Rollback(rollback) => &rollback.transaction_id,
        }
    }
}

fn parse_body<'a, T: Deserialize<'a>>(event: &str, data: &'a RawValue) -> Result<T, DecodeError> {
    serde_json::from_str(data.get()).map_err(|e| DecodeError::MalformedBody {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

fn parse_transaction_id(event: &str, raw: &str) -> Result<TransactionId, DecodeError> {
    raw.parse().map_err(|e: crate::ledger::ParseTransactionIdError| {
        DecodeError::MalformedBody {
            event: event.to_string(),
            reason: e.to_string(),
        }
    })
}

fn coalesce_lines(products: Vec<LineBody>) -> Result<Vec<LedgerLine>, DecodeError> {
    let invalid = |reason: String| DecodeError::MalformedBody {
        event: REDUCE_STOCK.to_string(),
        reason,
    };

    if products.is_empty() {
        return Err(invalid("at least one product line is required".to_string()));
    }

    let mut lines: Vec<LedgerLine> = Vec::with_capacity(products.len());
    for product in products {
        let product_id: ProductId = product
            .product_id
            .parse()
            .map_err(|e: crate::product::ParseProductIdError| invalid(e.to_string()))?;
        if product.quantity < 1 {
            return Err(invalid(format!(
                "stock must be reduced by at least 1, got {} for product {product_id}",
                product.quantity
            )));
        }
        let quantity = u32::try_from(product.quantity).map_err(|_| {
            invalid(format!(
                "quantity {} for product {product_id} is too large",
                product.quantity
            ))
        })?;

        if let Some(existing) = lines.iter_mut().find(|l| l.product_id == product_id) {
            existing.quantity = existing.quantity.checked_add(quantity).ok_or_else(|| {
                invalid(format!("combined quantity for product {product_id} is too large"))
            })?;
        } else {
            lines.push(LedgerLine::new(product_id, quantity));
        }
    }
    Ok(lines)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reduce(lines: &str) -> Vec<u8> {
        format!(
            r#"{{"event":"reduce_stock","data":{{"transaction_id":"tx-1","products":[{lines}]}}}}"#
        )
        .into_bytes()
    }

    #[test]
    fn decodes_reduce() {
        let command = StockCommand::decode(&reduce(
            r#"{"product_id":"a","quantity":2},{"product_id":"b","quantity":1}"#,
        ))
        .unwrap();
        assert_eq!(
            command,
            StockCommand::Reduce(ReduceStock {
                transaction_id: TransactionId::new("tx-1"),
                lines: vec![LedgerLine::new("a", 2), LedgerLine::new("b", 1)],
            })
        );
    }

    #[test]
    fn coalesces_repeated_products_in_first_occurrence_order() {
        let command = StockCommand::decode(&reduce(
            r#"{"product_id":"b","quantity":1},{"product_id":"a","quantity":2},{"product_id":"b","quantity":4}"#,
        ))
        .unwrap();
        let StockCommand::Reduce(reduce) = command else {
            unreachable!("decoded a reduce payload");
        };
        assert_eq!(reduce.lines, vec![LedgerLine::new("b", 5), LedgerLine::new("a", 2)]);
    }

    #[test]
    fn rejects_non_positive_quantity() {
        for quantity in ["0", "-3"] {
            let err = StockCommand::decode(&reduce(&format!(
                r#"{{"product_id":"a","quantity":{quantity}}}"#
            )))
            .unwrap_err();
            assert!(matches!(err, DecodeError::MalformedBody { .. }), "{err}");
        }
    }

    #[test]
    fn rejects_empty_line_list_and_blank_ids() {
        assert!(matches!(
            StockCommand::decode(&reduce("")),
            Err(DecodeError::MalformedBody { .. })
        ));
        assert!(matches!(
            StockCommand::decode(&reduce(r#"{"product_id":"","quantity":1}"#)),
            Err(DecodeError::MalformedBody { .. })
        ));
        assert!(matches!(
            StockCommand::decode(br#"{"event":"rollback_stock","data":{"transaction_id":""}}"#),
            Err(DecodeError::MalformedBody { .. })
        ));
    }

    #[test]
    fn unknown_event_is_distinguished_from_malformed_input() {
        let err = StockCommand::decode(br#"{"event":"increase_stock","data":{}}"#).unwrap_err();
        assert!(err.is_unknown_event());

        let err = StockCommand::decode(b"not json").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedEnvelope(_)));
        assert!(!err.is_unknown_event());

        let err = StockCommand::decode(br#"{"event":"reduce_stock"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedEnvelope(_)));
    }

    #[test]
    fn rollback_body_with_missing_field_is_malformed() {
        let err = StockCommand::decode(br#"{"event":"rollback_stock","data":{"id":"x"}}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedBody { ref event, .. } if event == "rollback_stock"));
    }

    proptest! {
        #[test]
        fn coalescing_preserves_per_product_totals(
            lines in prop::collection::vec(("[a-d]", 1u32..1000), 1..12),
        ) {
            let body = lines
                .iter()
                .map(|(p, q)| format!(r#"{{"product_id":"{p}","quantity":{q}}}"#))
                .collect::<Vec<_>>()
                .join(",");
            let StockCommand::Reduce(decoded) = StockCommand::decode(&reduce(&body)).unwrap() else {
                unreachable!("decoded a reduce payload");
            };

            let mut first_seen: Vec<&str> = Vec::new();
            for (product, _) in &lines {
                if !first_seen.contains(&product.as_str()) {
                    first_seen.push(product);
                }
            }
            let order: Vec<&str> = decoded.lines.iter().map(|l| l.product_id.as_str()).collect();
            prop_assert_eq!(order, first_seen);

            for line in &decoded.lines {
                let expected: u32 = lines
                    .iter()
                    .filter(|(p, _)| p == line.product_id.as_str())
                    .map(|(_, q)| q)
                    .sum();
                prop_assert_eq!(line.quantity, expected);
            }
        }
    }
}
