//! Server crate provides HTTP server functionality.
//!
//! This module implements the HTTP surface of the order-payment saga:
//! order creation and lookup, the internal payment-processing endpoint,
//! and the provider webhook ingress.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use model::{CreateOrderRequest, PaymentRequest};
use payment::{PaymentError, PaymentService};
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use service::{OrderService, ServiceError};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Header carrying the caller identity, forwarded by the upstream gateway
/// which has already authenticated the caller.
const USER_EMAIL_HEADER: &str = "X-User-Email";
/// Header carrying the provider's webhook signature.
const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Server represents the HTTP server for the order-payment backend.
pub struct Server {
    orders: Arc<dyn OrderService>,
    payments: Arc<dyn PaymentService>,
    webhook_secret: String,
    port: String,
    metrics: Arc<Metrics>,
}

/// Metrics collects and exposes HTTP server metrics.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )
        .expect("Failed to create http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )
        .expect("Failed to create http_request_duration_seconds metric");

        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of errors"),
            &["source", "endpoint"],
        )
        .expect("Failed to create errors_total metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("Failed to register http_requests_total metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("Failed to register http_request_duration_seconds metric");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("Failed to register errors_total metric");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
        }
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }

    fn record_error(&self, source: &str, endpoint: &str) {
        self.errors_total
            .with_label_values(&[source, endpoint])
            .inc();
    }
}

/// Application state shared between request handlers
#[derive(Clone)]
struct AppState {
    orders: Arc<dyn OrderService>,
    payments: Arc<dyn PaymentService>,
    webhook_secret: String,
    metrics: Arc<Metrics>,
}

impl Server {
    /// Creates a new Server instance.
    ///
    /// # Arguments
    ///
    /// * `port` - The port on which the server will listen
    /// * `orders` - The order orchestration service
    /// * `payments` - The payment service (processing + webhook reconciliation)
    /// * `webhook_secret` - Shared secret for provider webhook signatures
    pub fn new(
        port: String,
        orders: Arc<dyn OrderService>,
        payments: Arc<dyn PaymentService>,
        webhook_secret: String,
    ) -> Self {
        info!("Initializing HTTP server on port {}", port);

        Self {
            orders,
            payments,
            webhook_secret,
            port,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Starts the server and blocks until it's shut down.
    pub async fn start(&self) -> Result<()> {
        let app = self.create_router();

        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("HTTP server listening on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    fn create_router(&self) -> Router {
        let metrics = self.metrics.clone();

        Self::router_with_state(AppState {
            orders: self.orders.clone(),
            payments: self.payments.clone(),
            webhook_secret: self.webhook_secret.clone(),
            metrics,
        })
    }

    fn router_with_state(state: AppState) -> Router {
        let metrics = state.metrics.clone();

        Router::new()
            .route("/orders", post(Self::handle_create_order))
            .route("/orders", get(Self::handle_list_orders))
            .route("/orders/{id}", get(Self::handle_get_order))
            .route("/orders/{id}", delete(Self::handle_delete_order))
            .route("/payments/process", post(Self::handle_process_payment))
            .route("/payments/webhooks/events", post(Self::handle_webhook))
            .route("/health", get(Self::handle_health))
            .route("/metrics", get(Self::handle_metrics))
            .layer(axum::middleware::from_fn_with_state(
                metrics,
                Self::metrics_middleware,
            ))
            .with_state(state)
    }

    /// Middleware for collecting metrics on HTTP requests
    async fn metrics_middleware(
        State(metrics): State<Arc<Metrics>>,
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> Response {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let start = std::time::Instant::now();
        let response = next.run(req).await;
        let duration = start.elapsed();

        let status = response.status().as_u16();
        metrics.record_request(&method, &path, status, duration);
        if status >= 400 {
            metrics.record_error("http", &path);
        }

        response
    }

    async fn handle_create_order(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<CreateOrderRequest>,
    ) -> Response {
        let Some(user_email) = headers
            .get(USER_EMAIL_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            warn!("Order creation without caller identity header");
            return (StatusCode::BAD_REQUEST, "caller identity header missing").into_response();
        };

        match state.orders.create_order(user_email, &request).await {
            Ok(order) => (StatusCode::CREATED, Json(order)).into_response(),
            Err(err) => order_error_response(err),
        }
    }

    async fn handle_list_orders(State(state): State<AppState>) -> Response {
        match state.orders.list_orders().await {
            Ok(orders) => (StatusCode::OK, Json(orders)).into_response(),
            Err(err) => order_error_response(err),
        }
    }

    async fn handle_get_order(
        State(state): State<AppState>,
        AxumPath(order_id): AxumPath<i64>,
    ) -> Response {
        match state.orders.get_order(order_id).await {
            Ok(order) => (StatusCode::OK, Json(order)).into_response(),
            Err(err) => order_error_response(err),
        }
    }

    async fn handle_delete_order(
        State(state): State<AppState>,
        AxumPath(order_id): AxumPath<i64>,
    ) -> Response {
        match state.orders.delete_order(order_id).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(err) => order_error_response(err),
        }
    }

    /// Internal-only endpoint, called by the order orchestrator. Exposed for
    /// parity with the payment service API; the in-process orchestrator uses
    /// the same service directly.
    async fn handle_process_payment(
        State(state): State<AppState>,
        Json(request): Json<PaymentRequest>,
    ) -> Response {
        match state.payments.process_payment(&request).await {
            Ok(attempt) => (StatusCode::OK, Json(attempt.to_response())).into_response(),
            Err(PaymentError::Invalid(message)) => {
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            Err(err @ PaymentError::Communication(_)) => {
                error!("Payment processing failed: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, "payment provider unreachable")
                    .into_response()
            }
            Err(err) => {
                error!("Payment processing failed: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }

    /// Provider webhook ingress. A delivery that fails signature
    /// verification or does not parse causes no state change and gets a 400;
    /// recognized events are acknowledged with 200 even when reconciliation
    /// is a no-op, so the provider does not retry events this system never
    /// tracked.
    async fn handle_webhook(
        State(state): State<AppState>,
        headers: HeaderMap,
        body: String,
    ) -> Response {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if let Err(err) = payment::verify_signature(&state.webhook_secret, body.as_bytes(), signature)
        {
            warn!("Webhook rejected: {err}");
            return (StatusCode::BAD_REQUEST, "invalid signature").into_response();
        }

        let event = match payment::parse_event(body.as_bytes()) {
            Ok(event) => event,
            Err(err) => {
                warn!("Webhook payload did not parse: {err}");
                return (StatusCode::BAD_REQUEST, "invalid payload").into_response();
            }
        };

        match state.payments.handle_event(&event).await {
            Ok(()) => (StatusCode::OK, "event processed").into_response(),
            Err(err) => {
                // Store failure: let the provider retry the delivery.
                error!("Webhook reconciliation failed: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, "reconciliation failed").into_response()
            }
        }
    }

    async fn handle_health() -> &'static str {
        "OK"
    }

    async fn handle_metrics(State(state): State<AppState>) -> Response {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
        }

        match String::from_utf8(buffer) {
            Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
            Err(e) => {
                error!("Failed to convert metrics to UTF-8: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
            }
        }
    }
}

/// Maps an orchestration error onto an HTTP status plus a short
/// machine-checkable reason string.
fn order_error_response(err: ServiceError) -> Response {
    let status = match &err {
        ServiceError::InvalidOrder(_)
        | ServiceError::PaymentDeclined(_)
        | ServiceError::PaymentRejected(_) => StatusCode::BAD_REQUEST,
        ServiceError::ProductNotFound(_) | ServiceError::NotFound => StatusCode::NOT_FOUND,
        ServiceError::CatalogUnavailable(_)
        | ServiceError::PaymentUnavailable(_)
        | ServiceError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = match &err {
        // Never leak database details to the client.
        ServiceError::Db(_) => "internal error".to_string(),
        other => other.to_string(),
    };
    if status.is_server_error() {
        error!("Request failed: {err}");
    }
    (status, body).into_response()
}

/// Waits for a shutdown signal (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use hmac::{Hmac, Mac};
    use model::{NormalizedPaymentEvent, Order, OrderStatus, PaymentOutcome};
    use sha2::Sha256;
    use std::sync::Mutex;
    use tower::ServiceExt;

    const WEBHOOK_SECRET: &str = "whsec_test";

    struct MockOrders {
        order: Order,
    }

    #[async_trait]
    impl OrderService for MockOrders {
        async fn create_order(
            &self,
            _user_email: &str,
            request: &CreateOrderRequest,
        ) -> Result<Order, ServiceError> {
            if request.items.iter().any(|i| i.product_id == "P9") {
                return Err(ServiceError::ProductNotFound("P9".to_string()));
            }
            Ok(self.order.clone())
        }

        async fn get_order(&self, id: i64) -> Result<Order, ServiceError> {
            if id == self.order.id {
                Ok(self.order.clone())
            } else {
                Err(ServiceError::NotFound)
            }
        }

        async fn list_orders(&self) -> Result<Vec<Order>, ServiceError> {
            Ok(vec![self.order.clone()])
        }

        async fn delete_order(&self, id: i64) -> Result<(), ServiceError> {
            if id == self.order.id {
                Ok(())
            } else {
                Err(ServiceError::NotFound)
            }
        }

        async fn apply_payment_outcome(
            &self,
            _order_id: i64,
            _outcome: PaymentOutcome,
        ) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockPayments {
        events: Mutex<Vec<NormalizedPaymentEvent>>,
    }

    #[async_trait]
    impl PaymentService for MockPayments {
        async fn process_payment(
            &self,
            request: &PaymentRequest,
        ) -> Result<payment::PaymentAttempt, PaymentError> {
            Err(PaymentError::Invalid(format!(
                "unused in these tests (order {})",
                request.order_id
            )))
        }

        async fn handle_event(
            &self,
            event: &NormalizedPaymentEvent,
        ) -> Result<(), PaymentError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn sample_order() -> Order {
        Order {
            id: 1,
            user_email: "buyer@example.com".to_string(),
            lines: vec![],
            total_price: 20.0,
            status: OrderStatus::PaymentIntentCreated,
            created_at: Utc::now(),
        }
    }

    fn test_router() -> (Router, Arc<MockPayments>) {
        let payments = Arc::new(MockPayments::default());
        let state = AppState {
            orders: Arc::new(MockOrders {
                order: sample_order(),
            }),
            payments: payments.clone(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
            metrics: Arc::new(Metrics::new()),
        };
        (Server::router_with_state(state), payments)
    }

    fn signed_header(payload: &str, secret: &str) -> String {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[tokio::test]
    async fn test_create_order_returns_201() {
        let (router, _) = test_router();
        let response = router
            .oneshot(
                Request::post("/orders")
                    .header("Content-Type", "application/json")
                    .header(USER_EMAIL_HEADER, "buyer@example.com")
                    .body(Body::from(
                        r#"{"items":[{"product_id":"P1","quantity":2}],"payment_method_token":"tok_visa"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_create_order_without_identity_is_400() {
        let (router, _) = test_router();
        let response = router
            .oneshot(
                Request::post("/orders")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        r#"{"items":[{"product_id":"P1","quantity":2}],"payment_method_token":"tok_visa"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_product_is_404() {
        let (router, _) = test_router();
        let response = router
            .oneshot(
                Request::post("/orders")
                    .header("Content-Type", "application/json")
                    .header(USER_EMAIL_HEADER, "buyer@example.com")
                    .body(Body::from(
                        r#"{"items":[{"product_id":"P9","quantity":1}],"payment_method_token":"tok_visa"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_missing_order_is_404() {
        let (router, _) = test_router();
        let response = router
            .oneshot(Request::get("/orders/999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_with_invalid_signature_is_400_and_mutates_nothing() {
        let (router, payments) = test_router();
        let payload = r#"{"type":"payment_intent.succeeded","data":{"object":{"id":"pi_1"}}}"#;
        let response = router
            .oneshot(
                Request::post("/payments/webhooks/events")
                    .header(SIGNATURE_HEADER, signed_header(payload, "wrong_secret"))
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(payments.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_with_valid_signature_is_200_and_delegates() {
        let (router, payments) = test_router();
        let payload = r#"{"type":"payment_intent.succeeded","data":{"object":{"id":"pi_1"}}}"#;
        let response = router
            .oneshot(
                Request::post("/payments/webhooks/events")
                    .header(SIGNATURE_HEADER, signed_header(payload, WEBHOOK_SECRET))
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let events = payments.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            NormalizedPaymentEvent::Succeeded {
                provider_transaction_id: "pi_1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_webhook_with_unparseable_payload_is_400() {
        let (router, payments) = test_router();
        let payload = "not json";
        let response = router
            .oneshot(
                Request::post("/payments/webhooks/events")
                    .header(SIGNATURE_HEADER, signed_header(payload, WEBHOOK_SECRET))
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(payments.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = test_router();
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
