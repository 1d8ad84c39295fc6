//! Payment service: synchronous authorization and asynchronous reconciliation.

use crate::provider::{to_minor_units, IntentRequest, ProviderClient, ProviderError};
use crate::PaymentEventPublisher;
use async_trait::async_trait;
use model::{
    NewPaymentTransaction, NormalizedPaymentEvent, PaymentOutcome, PaymentRequest, PaymentResponse,
    PaymentStatus, PaymentTransaction,
};
use repository::{PaymentTransactionsRepository, RepositoryError};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// The main error type for payment operations.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The request itself is malformed (non-positive amount, missing token).
    /// Client-caused; no provider call is made and no row is written.
    #[error("invalid payment request: {0}")]
    Invalid(String),
    /// The provider could not be reached or answered with a server error.
    /// A FAILED transaction row has already been persisted when this is
    /// returned from `process_payment`.
    #[error("payment provider unreachable: {0}")]
    Communication(String),
    /// A repository (database) operation failed.
    #[error("Database error: {0}")]
    Db(#[from] RepositoryError),
}

/// Provisional outcome of the synchronous payment step, matched explicitly
/// by the orchestrator. A transaction row exists in both variants.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentAttempt {
    /// The provider accepted the authorization; the webhook will deliver the
    /// final outcome later.
    Created(PaymentTransaction),
    /// The provider explicitly declined. Terminal for this attempt.
    Declined {
        transaction: PaymentTransaction,
        reason: String,
    },
}

impl PaymentAttempt {
    /// Wire representation returned by `POST /payments/process`.
    pub fn to_response(&self) -> PaymentResponse {
        match self {
            PaymentAttempt::Created(tx) => PaymentResponse {
                provider_transaction_id: tx.provider_transaction_id.clone(),
                order_id: tx.order_id,
                status: tx.status,
                message: "payment intent created".to_string(),
            },
            PaymentAttempt::Declined { transaction, reason } => PaymentResponse {
                provider_transaction_id: transaction.provider_transaction_id.clone(),
                order_id: transaction.order_id,
                status: PaymentStatus::Failed,
                message: reason.clone(),
            },
        }
    }
}

/// Trait describing the payment side of the saga.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Synchronous payment step of order creation: requests an authorization
    /// from the provider and persists a transaction row whatever the answer
    /// was.
    async fn process_payment(&self, request: &PaymentRequest)
        -> Result<PaymentAttempt, PaymentError>;

    /// Reconciliation of a verified, normalized provider event. Keyed by
    /// provider transaction id; idempotent under duplicate or unrelated
    /// deliveries. Publishes the outcome on the bus when (and only when)
    /// this call moved the transaction to a terminal status.
    async fn handle_event(&self, event: &NormalizedPaymentEvent) -> Result<(), PaymentError>;
}

// One service instance is shared between the order orchestrator and the HTTP
// payment endpoints.
#[async_trait]
impl<T: PaymentService + ?Sized> PaymentService for std::sync::Arc<T> {
    async fn process_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentAttempt, PaymentError> {
        (**self).process_payment(request).await
    }

    async fn handle_event(&self, event: &NormalizedPaymentEvent) -> Result<(), PaymentError> {
        (**self).handle_event(event).await
    }
}

/// Implementation wiring the transaction repository, the provider client,
/// and the event publisher together.
pub struct PaymentServiceImpl<R, P, E> {
    transactions_repo: R,
    provider: P,
    publisher: E,
}

impl<R, P, E> PaymentServiceImpl<R, P, E>
where
    R: PaymentTransactionsRepository,
    P: ProviderClient,
    E: PaymentEventPublisher,
{
    pub fn new(transactions_repo: R, provider: P, publisher: E) -> Self {
        Self {
            transactions_repo,
            provider,
            publisher,
        }
    }

    fn validate_request(request: &PaymentRequest) -> Result<(), PaymentError> {
        if request.amount <= 0.0 {
            return Err(PaymentError::Invalid(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if request.payment_method_token.is_empty() {
            return Err(PaymentError::Invalid("payment method token is empty".into()));
        }
        if request.currency.is_empty() {
            return Err(PaymentError::Invalid("currency is empty".into()));
        }
        Ok(())
    }

    async fn finalize_and_publish(
        &self,
        provider_transaction_id: &str,
        status: PaymentStatus,
        error_message: Option<&str>,
        outcome: PaymentOutcome,
    ) -> Result<(), PaymentError> {
        match self
            .transactions_repo
            .finalize(provider_transaction_id, status, error_message)
            .await?
        {
            Some(order_id) => {
                info!(
                    order_id,
                    provider_transaction_id,
                    outcome = outcome.as_str(),
                    "Payment transaction finalized, publishing outcome"
                );
                // Publish after the durable write; the bus consumer's
                // terminal-state check absorbs any redelivery.
                if let Err(e) = self.publisher.publish(order_id, outcome).await {
                    error!(order_id, "Failed to publish payment outcome: {e}");
                }
                Ok(())
            }
            None => {
                // Nothing updated: either an id this system never tracked or
                // a duplicate delivery for an already-terminal row.
                match self
                    .transactions_repo
                    .get_by_provider_id(provider_transaction_id)
                    .await?
                {
                    Some(tx) => debug!(
                        provider_transaction_id,
                        status = tx.status.as_str(),
                        "Duplicate delivery for terminal transaction, ignoring"
                    ),
                    None => debug!(
                        provider_transaction_id,
                        "Event references an untracked transaction, ignoring"
                    ),
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<R, P, E> PaymentService for PaymentServiceImpl<R, P, E>
where
    R: PaymentTransactionsRepository,
    P: ProviderClient,
    E: PaymentEventPublisher,
{
    #[instrument(skip(self, request), fields(order_id = request.order_id))]
    async fn process_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentAttempt, PaymentError> {
        Self::validate_request(request)?;

        let intent_request = IntentRequest {
            order_id: request.order_id,
            amount_minor: to_minor_units(request.amount),
            currency: request.currency.clone(),
            payment_method_token: request.payment_method_token.clone(),
        };

        match self.provider.create_intent(&intent_request).await {
            Ok(authorization) => {
                let transaction = self
                    .transactions_repo
                    .insert(&NewPaymentTransaction::created(
                        request.order_id,
                        authorization.provider_transaction_id,
                        request.amount,
                        request.currency.clone(),
                    ))
                    .await?;
                info!(
                    order_id = request.order_id,
                    provider_transaction_id = ?transaction.provider_transaction_id,
                    "Payment intent created"
                );
                Ok(PaymentAttempt::Created(transaction))
            }
            Err(ProviderError::Declined(reason)) => {
                let transaction = self
                    .transactions_repo
                    .insert(&NewPaymentTransaction::failed(
                        request.order_id,
                        request.amount,
                        request.currency.clone(),
                        reason.clone(),
                    ))
                    .await?;
                warn!(order_id = request.order_id, reason = %reason, "Payment declined by provider");
                Ok(PaymentAttempt::Declined { transaction, reason })
            }
            Err(ProviderError::Communication(message)) => {
                // A row is written in this branch too, so the last known
                // outcome is always visible for later reconciliation.
                self.transactions_repo
                    .insert(&NewPaymentTransaction::failed(
                        request.order_id,
                        request.amount,
                        request.currency.clone(),
                        message.clone(),
                    ))
                    .await?;
                error!(order_id = request.order_id, "Payment provider unreachable: {message}");
                Err(PaymentError::Communication(message))
            }
        }
    }

    #[instrument(skip(self, event))]
    async fn handle_event(&self, event: &NormalizedPaymentEvent) -> Result<(), PaymentError> {
        match event {
            NormalizedPaymentEvent::Succeeded {
                provider_transaction_id,
            } => {
                self.finalize_and_publish(
                    provider_transaction_id,
                    PaymentStatus::Succeeded,
                    None,
                    PaymentOutcome::Succeeded,
                )
                .await
            }
            NormalizedPaymentEvent::Failed {
                provider_transaction_id,
                reason,
            } => {
                self.finalize_and_publish(
                    provider_transaction_id,
                    PaymentStatus::Failed,
                    Some(reason),
                    PaymentOutcome::Failed,
                )
                .await
            }
            NormalizedPaymentEvent::Unhandled { event_type } => {
                debug!(event_type = %event_type, "Ignoring unhandled provider event type");
                Ok(())
            }
        }
    }
}
