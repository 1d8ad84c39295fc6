//! Payment gateway adapter, webhook ingress, and reconciliation.
//!
//! This crate owns the payment side of the order-payment saga:
//! - [`provider`] wraps the third-party payment provider behind a typed
//!   client trait (authorization requests, minor-unit amounts).
//! - [`webhook`] verifies provider webhook signatures and normalizes the
//!   payload into a [`model::NormalizedPaymentEvent`].
//! - [`service`] persists payment transactions and reconciles asynchronous
//!   provider events back into durable state, publishing the outcome on the
//!   payment-events topic through [`PaymentEventPublisher`].

pub mod provider;
pub mod service;
pub mod webhook;

pub use provider::{HttpProviderClient, IntentRequest, ProviderClient, ProviderError};
pub use service::{PaymentAttempt, PaymentError, PaymentService, PaymentServiceImpl};
pub use webhook::{parse_event, verify_signature, WebhookError};

use async_trait::async_trait;
use model::PaymentOutcome;

/// Seam between the payment service and the message bus. The Kafka producer
/// implements this; tests use an in-memory recorder.
#[async_trait]
pub trait PaymentEventPublisher: Send + Sync {
    /// Publish a payment outcome keyed by the order id.
    async fn publish(&self, order_id: i64, outcome: PaymentOutcome) -> anyhow::Result<()>;
}
