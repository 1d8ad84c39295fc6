//! Kafka publisher for payment status events.
//!
//! The payment service publishes the final outcome of each transaction onto
//! the payment-events topic. Messages are keyed by the order id (decimal
//! string), so per-order ordering is preserved across partitions; the value
//! is the bare outcome string (`SUCCEEDED` / `FAILED`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use model::PaymentOutcome;
use payment::PaymentEventPublisher;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{error, info};

/// Kafka-backed implementation of [`PaymentEventPublisher`].
pub struct KafkaPaymentEventPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPaymentEventPublisher {
    /// Create a producer for the specified brokers/topic.
    pub fn new(brokers: &[String], topic: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "5000")
            .create()
            .context("Failed to create Kafka producer")?;

        info!(topic, "Kafka payment-events producer initialized");
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl PaymentEventPublisher for KafkaPaymentEventPublisher {
    async fn publish(&self, order_id: i64, outcome: PaymentOutcome) -> Result<()> {
        let key = order_id.to_string();
        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(outcome.as_str());

        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok(_) => {
                info!(order_id, outcome = outcome.as_str(), "Payment event published");
                Ok(())
            }
            Err((kafka_err, _owned_msg)) => {
                error!(order_id, "Failed to publish payment event: {kafka_err}");
                Err(anyhow::anyhow!("Kafka error: {kafka_err}"))
            }
        }
    }
}
