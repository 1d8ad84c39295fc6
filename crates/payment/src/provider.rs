//! Typed client for the payment provider's authorization API.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Authorization request handed to the provider. The amount is already in
/// the provider's minor-unit representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRequest {
    pub order_id: i64,
    pub amount_minor: i64,
    pub currency: String,
    pub payment_method_token: String,
}

/// Provisional result of a provider authorization. Whatever state the
/// provider reports synchronously, finality arrives only via the webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAuthorization {
    pub provider_transaction_id: String,
}

/// Failure modes of a provider call, matched explicitly by the caller:
/// a decline is client-caused and terminal, a communication failure is
/// transient and surfaced as a 5xx.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment provider unreachable: {0}")]
    Communication(String),
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Create and confirm a payment authorization with the provider.
    async fn create_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<ProviderAuthorization, ProviderError>;
}

/// Converts a major-unit amount to the provider's minor-unit representation,
/// rounded to the nearest integer cent.
pub fn to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: ProviderErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorDetail {
    message: String,
}

/// reqwest-backed provider client speaking the provider's payment-intent API.
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpProviderClient {
    /// Builds a client with a bounded per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Communication(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            secret_key: secret_key.into(),
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn create_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<ProviderAuthorization, ProviderError> {
        let url = format!("{}/v1/payment_intents", self.base_url.trim_end_matches('/'));
        debug!(order_id = request.order_id, "Creating payment intent");

        let body = serde_json::json!({
            "amount": request.amount_minor,
            "currency": request.currency,
            "confirm": true,
            "capture_method": "automatic",
            "payment_method_data": {
                "type": "card",
                "card": { "token": request.payment_method_token },
            },
            "metadata": { "order_id": request.order_id.to_string() },
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            // Ties retries of the same order to one authorization attempt.
            .header("Idempotency-Key", format!("order-{}", request.order_id))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Communication(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let intent: IntentResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::Communication(e.to_string()))?;
            return Ok(ProviderAuthorization {
                provider_transaction_id: intent.id,
            });
        }

        if status.is_client_error() {
            let message = match response.json::<ProviderErrorBody>().await {
                Ok(body) => body.error.message,
                Err(_) => format!("provider rejected the request with status {status}"),
            };
            return Err(ProviderError::Declined(message));
        }

        Err(ProviderError::Communication(format!(
            "provider returned status {status}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_units_rounds_to_nearest_cent() {
        assert_eq!(to_minor_units(19.99), 1999);
        assert_eq!(to_minor_units(20.0), 2000);
        assert_eq!(to_minor_units(0.1), 10);
        // Binary float artifacts like 32.99 * 100 = 3298.9999... still land
        // on the right cent.
        assert_eq!(to_minor_units(32.99), 3299);
    }
}
