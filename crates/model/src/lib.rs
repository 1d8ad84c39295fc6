use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an order through the payment saga.
///
/// Forward-only: `PENDING_PAYMENT → PAYMENT_INTENT_CREATED → {COMPLETED |
/// PAYMENT_FAILED}`. The `*_SYNC`/`*_ERROR_*` states are early exits taken
/// when the synchronous payment step itself fails. Every state except
/// `PENDING_PAYMENT` and `PAYMENT_INTENT_CREATED` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingPayment,
    PaymentIntentCreated,
    Completed,
    PaymentFailed,
    PaymentFailedSync,
    PaymentErrorClient,
    PaymentErrorCommunication,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::PaymentIntentCreated => "PAYMENT_INTENT_CREATED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::PaymentFailed => "PAYMENT_FAILED",
            OrderStatus::PaymentFailedSync => "PAYMENT_FAILED_SYNC",
            OrderStatus::PaymentErrorClient => "PAYMENT_ERROR_CLIENT",
            OrderStatus::PaymentErrorCommunication => "PAYMENT_ERROR_COMMUNICATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_PAYMENT" => Some(OrderStatus::PendingPayment),
            "PAYMENT_INTENT_CREATED" => Some(OrderStatus::PaymentIntentCreated),
            "COMPLETED" => Some(OrderStatus::Completed),
            "PAYMENT_FAILED" => Some(OrderStatus::PaymentFailed),
            "PAYMENT_FAILED_SYNC" => Some(OrderStatus::PaymentFailedSync),
            "PAYMENT_ERROR_CLIENT" => Some(OrderStatus::PaymentErrorClient),
            "PAYMENT_ERROR_COMMUNICATION" => Some(OrderStatus::PaymentErrorCommunication),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions; a stale or duplicate
    /// event must never resurrect one.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            OrderStatus::PendingPayment | OrderStatus::PaymentIntentCreated
        )
    }
}

/// Durable state of a payment transaction row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Created,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Created => "CREATED",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PaymentStatus::Pending),
            "CREATED" => Some(PaymentStatus::Created),
            "SUCCEEDED" => Some(PaymentStatus::Succeeded),
            "FAILED" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Succeeded | PaymentStatus::Failed)
    }
}

/// The value carried on the payment-events topic
/// (key = order id, value = outcome string).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
}

impl PaymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Succeeded => "SUCCEEDED",
            PaymentOutcome::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCEEDED" => Some(PaymentOutcome::Succeeded),
            "FAILED" => Some(PaymentOutcome::Failed),
            _ => None,
        }
    }
}

/// One item of an order. The unit price is captured once at
/// order time, so the stored total is insensitive to later catalog changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderLine {
    #[serde(rename = "product_id")]
    pub product_id: String,
    pub quantity: i32,
    #[serde(rename = "price_at_order")]
    pub price_at_order: f64,
}

impl OrderLine {
    pub fn subtotal(&self) -> f64 {
        f64::from(self.quantity) * self.price_at_order
    }
}

/// The orchestrator-owned order aggregate. The identifier is assigned by
/// the store on insert; `NewOrder` is the pre-persistence shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: i64,
    #[serde(rename = "user_email")]
    pub user_email: String,
    pub lines: Vec<OrderLine>,
    #[serde(rename = "total_price")]
    pub total_price: f64,
    pub status: OrderStatus,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
}

/// A fully-initialized order value built before any store call
/// (status and timestamp set by the factory, not by persistence hooks).
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub user_email: String,
    pub lines: Vec<OrderLine>,
    pub total_price: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl NewOrder {
    /// Builds a `PENDING_PAYMENT` order; the total is derived from the lines.
    pub fn pending_payment(user_email: impl Into<String>, lines: Vec<OrderLine>) -> Self {
        let total_price = lines.iter().map(OrderLine::subtotal).sum();
        Self {
            user_email: user_email.into(),
            lines,
            total_price,
            status: OrderStatus::PendingPayment,
            created_at: Utc::now(),
        }
    }
}

/// Durable payment record; at most one per order, the
/// provider transaction id is unique and absent until the provider responds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentTransaction {
    pub id: i64,
    #[serde(rename = "order_id")]
    pub order_id: i64,
    #[serde(rename = "provider_transaction_id")]
    pub provider_transaction_id: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub status: PaymentStatus,
    #[serde(rename = "error_message")]
    pub error_message: Option<String>,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
}

/// Pre-persistence payment record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPaymentTransaction {
    pub order_id: i64,
    pub provider_transaction_id: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub status: PaymentStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewPaymentTransaction {
    /// Provisional record for an authorization the provider accepted.
    pub fn created(
        order_id: i64,
        provider_transaction_id: impl Into<String>,
        amount: f64,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            order_id,
            provider_transaction_id: Some(provider_transaction_id.into()),
            amount,
            currency: currency.into(),
            status: PaymentStatus::Created,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// Record for a declined or failed authorization attempt. A row is
    /// written in this branch too, never left absent.
    pub fn failed(
        order_id: i64,
        amount: f64,
        currency: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            order_id,
            provider_transaction_id: None,
            amount,
            currency: currency.into(),
            status: PaymentStatus::Failed,
            error_message: Some(error_message.into()),
            created_at: Utc::now(),
        }
    }
}

/// Transient event extracted from a verified
/// provider webhook. Delivery is at-least-once, so consumers must stay
/// idempotent against transaction/order state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedPaymentEvent {
    Succeeded {
        provider_transaction_id: String,
    },
    Failed {
        provider_transaction_id: String,
        reason: String,
    },
    Unhandled {
        event_type: String,
    },
}

/// Request body for `POST /orders`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemRequest>,
    #[serde(rename = "payment_method_token")]
    pub payment_method_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderItemRequest {
    #[serde(rename = "product_id")]
    pub product_id: String,
    pub quantity: i32,
}

/// Request body for `POST /payments/process` (internal-only; also the shape
/// the orchestrator hands to the payment service in-process).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRequest {
    #[serde(rename = "order_id")]
    pub order_id: i64,
    pub amount: f64,
    pub currency: String,
    #[serde(rename = "payment_method_token")]
    pub payment_method_token: String,
}

/// Provisional result of the synchronous payment step. Not the final truth:
/// finality arrives only through the webhook path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentResponse {
    #[serde(rename = "provider_transaction_id")]
    pub provider_transaction_id: Option<String>,
    #[serde(rename = "order_id")]
    pub order_id: i64,
    pub status: PaymentStatus,
    pub message: String,
}
