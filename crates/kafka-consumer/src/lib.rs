//! Kafka consumer applying payment outcomes to orders.
//!
//! Long-lived loop on the payment-events topic: key = order id, value =
//! outcome string. Offsets are committed explicitly, and only once a message
//! no longer needs redelivery: applied outcomes and skip cases (malformed
//! payload, unknown order) commit, while a transient store failure leaves the
//! offset alone so the event comes back. Idempotency lives in the order
//! service's terminal-state check, so at-least-once delivery is safe.

use anyhow::Result;
use model::PaymentOutcome;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use service::{OrderService, ServiceError};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// PaymentEventsConsumer wraps the underlying StreamConsumer and the order
/// service it delegates to.
pub struct PaymentEventsConsumer<S: OrderService + Send + Sync + 'static> {
    consumer: StreamConsumer,
    order_service: Arc<S>,
}

/// Decodes a raw key/value pair into (order id, outcome).
///
/// Kept separate from the consumer so the strictness of the decoding is
/// testable without a broker.
pub fn decode_event(
    key: Option<&[u8]>,
    payload: Option<&[u8]>,
) -> Result<(i64, PaymentOutcome), String> {
    let key = key.ok_or("message has no key")?;
    let payload = payload.ok_or("message has no payload")?;

    let order_id: i64 = std::str::from_utf8(key)
        .map_err(|_| "key is not valid UTF-8".to_string())?
        .parse()
        .map_err(|_| "key is not an order id".to_string())?;

    let status = std::str::from_utf8(payload).map_err(|_| "payload is not valid UTF-8")?;
    let outcome =
        PaymentOutcome::parse(status).ok_or_else(|| format!("unknown outcome {status:?}"))?;

    Ok((order_id, outcome))
}

/// Decides whether the offset may advance past a processed event.
///
/// A transient store failure must not commit: the settlement event is the
/// only signal that the order reached its outcome, so it has to be
/// redelivered. Everything else commits; a skipped message would otherwise
/// wedge the partition, and redelivering it cannot change the result.
pub fn commit_after(result: &Result<(), ServiceError>) -> bool {
    !matches!(result, Err(ServiceError::Db(_)))
}

impl<S: OrderService + Send + Sync + 'static> PaymentEventsConsumer<S> {
    /// Create a new Kafka consumer for the specified brokers/topic/group.
    pub fn new(
        brokers: &[String],
        topic: &str,
        group_id: &str,
        order_service: Arc<S>,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            // Commit explicitly after each handled message.
            .set("enable.auto.commit", "false")
            .create()?;

        consumer.subscribe(&[topic])?;
        Ok(Self {
            consumer,
            order_service,
        })
    }

    /// Runs the main consumption loop until the given context is cancelled.
    ///
    /// # Arguments
    /// * `shutdown`: a signal for graceful shutdown (e.g., tokio::sync::Notify).
    pub async fn run(&self, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
        let mut stream = self.consumer.stream();

        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    match maybe_msg {
                        Some(Ok(msg)) => {
                            if self.handle_message(&msg).await {
                                if let Err(e) = self.consumer.commit_message(&msg, CommitMode::Async) {
                                    error!("Failed to commit offset: {e}");
                                }
                            } else {
                                warn!(offset = msg.offset(), "Leaving offset uncommitted for redelivery");
                            }
                        }
                        Some(Err(e)) => {
                            error!("Kafka error: {e}");
                        }
                        None => {
                            debug!("Kafka stream ended.");
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("Payment events consumer received shutdown signal.");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handles a single message: decodes the event and applies the outcome
    /// to the order. Returns whether the offset may be committed; a poison
    /// message commits (it cannot wedge the partition), a transient store
    /// failure does not.
    async fn handle_message(&self, msg: &BorrowedMessage<'_>) -> bool {
        let (order_id, outcome) = match decode_event(msg.key(), msg.payload()) {
            Ok(decoded) => decoded,
            Err(reason) => {
                warn!(offset = msg.offset(), "Skipping malformed payment event: {reason}");
                return true;
            }
        };

        info!(order_id, outcome = outcome.as_str(), "Payment event received");
        let result = self.order_service.apply_payment_outcome(order_id, outcome).await;
        match &result {
            Ok(()) => {}
            Err(ServiceError::NotFound) => {
                warn!(order_id, "Payment event references an unknown order");
            }
            Err(e) => {
                error!(order_id, "Failed to apply payment outcome: {e}");
            }
        }
        commit_after(&result)
    }
}
