//! Order orchestration: the business side of the order-payment saga.
//!
//! [`OrderServiceImpl`] owns order creation (pricing every line against
//! the catalog, persisting the order as `PENDING_PAYMENT`, driving the
//! synchronous payment step, and recording the resulting status) and it owns
//! the asynchronous transition applied when the bus delivers the final
//! payment outcome. Collaborators arrive through the constructor behind
//! small traits; there is no runtime container.

use async_trait::async_trait;
use catalog_client::{CatalogClient, CatalogError};
use model::{CreateOrderRequest, NewOrder, Order, OrderLine, OrderStatus, PaymentOutcome, PaymentRequest};
use payment::{PaymentAttempt, PaymentError, PaymentService};
use repository::{OrdersRepository, RepositoryError};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// The main error type for all operations in [`OrderService`]. Every
/// creation failure maps to one HTTP status plus a short reason string.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The provided order is structurally or semantically invalid.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),
    /// A referenced product is unknown to the catalog.
    #[error("product not found: {0}")]
    ProductNotFound(String),
    /// The catalog collaborator could not be reached.
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),
    /// The provider explicitly declined the synchronous payment step.
    #[error("payment declined: {0}")]
    PaymentDeclined(String),
    /// The payment adapter rejected the request as client-caused.
    #[error("payment rejected: {0}")]
    PaymentRejected(String),
    /// The payment provider could not be reached; the order is retained in
    /// `PAYMENT_ERROR_COMMUNICATION` for later reconciliation.
    #[error("payment service unavailable: {0}")]
    PaymentUnavailable(String),
    /// The requested order does not exist.
    #[error("order not found")]
    NotFound,
    /// A repository (database) operation failed.
    #[error("Database error: {0}")]
    Db(RepositoryError),
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => ServiceError::NotFound,
            other => ServiceError::Db(other),
        }
    }
}

/// Trait describing business operations for order management.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Runs the order-creation saga for the given caller identity.
    async fn create_order(
        &self,
        user_email: &str,
        request: &CreateOrderRequest,
    ) -> Result<Order, ServiceError>;

    /// Retrieves the full order (lines included) by id.
    async fn get_order(&self, id: i64) -> Result<Order, ServiceError>;

    /// Lists all orders.
    async fn list_orders(&self) -> Result<Vec<Order>, ServiceError>;

    /// Deletes an order by id.
    async fn delete_order(&self, id: i64) -> Result<(), ServiceError>;

    /// Applies a bus-delivered payment outcome to the order. Idempotent:
    /// an order already in a terminal state is left untouched.
    async fn apply_payment_outcome(
        &self,
        order_id: i64,
        outcome: PaymentOutcome,
    ) -> Result<(), ServiceError>;
}

/// Orchestrator implementation over the repository, the catalog price
/// oracle, and the payment service.
pub struct OrderServiceImpl<R, C, P> {
    orders_repo: R,
    catalog: C,
    payments: P,
    currency: String,
}

impl<R, C, P> OrderServiceImpl<R, C, P>
where
    R: OrdersRepository,
    C: CatalogClient,
    P: PaymentService,
{
    pub fn new(orders_repo: R, catalog: C, payments: P, currency: impl Into<String>) -> Self {
        Self {
            orders_repo,
            catalog,
            payments,
            currency: currency.into(),
        }
    }

    /// Prices every requested line against the catalog. Nothing is persisted
    /// before this step succeeds, so a bad product id aborts the whole order
    /// without side effects.
    async fn price_lines(
        &self,
        request: &CreateOrderRequest,
    ) -> Result<Vec<OrderLine>, ServiceError> {
        if request.items.is_empty() {
            return Err(ServiceError::InvalidOrder("order has no items".into()));
        }
        if request.payment_method_token.is_empty() {
            return Err(ServiceError::InvalidOrder(
                "payment method token is empty".into(),
            ));
        }

        let mut lines = Vec::with_capacity(request.items.len());
        for item in &request.items {
            if item.quantity <= 0 {
                return Err(ServiceError::InvalidOrder(format!(
                    "quantity must be positive for product {}",
                    item.product_id
                )));
            }
            let product = self
                .catalog
                .get_product(&item.product_id)
                .await
                .map_err(|e| match e {
                    CatalogError::NotFound(id) => ServiceError::ProductNotFound(id),
                    CatalogError::Communication(msg) => ServiceError::CatalogUnavailable(msg),
                })?;
            if product.price <= 0.0 {
                return Err(ServiceError::InvalidOrder(format!(
                    "catalog reported a non-positive price for product {}",
                    item.product_id
                )));
            }
            // Capture the price once; the order total stays insensitive to
            // later catalog changes.
            lines.push(OrderLine {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
                price_at_order: product.price,
            });
        }
        Ok(lines)
    }

    /// Records the post-payment status. The order row is retained in every
    /// failure branch rather than rolled back, so partial failure stays
    /// visible for reconciliation.
    async fn mark(&self, order_id: i64, status: OrderStatus) -> Result<(), ServiceError> {
        self.orders_repo.update_status(order_id, status).await?;
        Ok(())
    }
}

#[async_trait]
impl<R, C, P> OrderService for OrderServiceImpl<R, C, P>
where
    R: OrdersRepository,
    C: CatalogClient,
    P: PaymentService,
{
    #[instrument(skip(self, request))]
    async fn create_order(
        &self,
        user_email: &str,
        request: &CreateOrderRequest,
    ) -> Result<Order, ServiceError> {
        let lines = self.price_lines(request).await?;

        let mut order = self
            .orders_repo
            .insert(&NewOrder::pending_payment(user_email, lines))
            .await?;
        info!(order_id = order.id, total = order.total_price, "Order persisted as PENDING_PAYMENT");

        let payment_request = PaymentRequest {
            order_id: order.id,
            amount: order.total_price,
            currency: self.currency.clone(),
            payment_method_token: request.payment_method_token.clone(),
        };

        match self.payments.process_payment(&payment_request).await {
            Ok(PaymentAttempt::Created(_)) => {
                let advanced = self
                    .orders_repo
                    .update_status(order.id, OrderStatus::PaymentIntentCreated)
                    .await?;
                if advanced {
                    order.status = OrderStatus::PaymentIntentCreated;
                } else {
                    // The webhook can settle the order before this write
                    // lands; the response carries the stored status.
                    order = self.orders_repo.get_by_id(order.id).await?;
                }
                info!(
                    order_id = order.id,
                    status = order.status.as_str(),
                    "Payment intent created for order"
                );
                Ok(order)
            }
            Ok(PaymentAttempt::Declined { reason, .. }) => {
                self.mark(order.id, OrderStatus::PaymentFailedSync).await?;
                warn!(order_id = order.id, reason = %reason, "Synchronous payment decline");
                Err(ServiceError::PaymentDeclined(reason))
            }
            Err(PaymentError::Invalid(message)) => {
                self.mark(order.id, OrderStatus::PaymentErrorClient).await?;
                Err(ServiceError::PaymentRejected(message))
            }
            Err(PaymentError::Communication(message)) => {
                self.mark(order.id, OrderStatus::PaymentErrorCommunication).await?;
                Err(ServiceError::PaymentUnavailable(message))
            }
            Err(PaymentError::Db(err)) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    async fn get_order(&self, id: i64) -> Result<Order, ServiceError> {
        Ok(self.orders_repo.get_by_id(id).await?)
    }

    #[instrument(skip(self))]
    async fn list_orders(&self) -> Result<Vec<Order>, ServiceError> {
        Ok(self.orders_repo.list().await?)
    }

    #[instrument(skip(self))]
    async fn delete_order(&self, id: i64) -> Result<(), ServiceError> {
        Ok(self.orders_repo.delete(id).await?)
    }

    #[instrument(skip(self))]
    async fn apply_payment_outcome(
        &self,
        order_id: i64,
        outcome: PaymentOutcome,
    ) -> Result<(), ServiceError> {
        let order = self.orders_repo.get_by_id(order_id).await?;
        if order.status.is_terminal() {
            info!(
                order_id,
                status = order.status.as_str(),
                "Order already terminal, ignoring payment outcome"
            );
            return Ok(());
        }

        let target = match outcome {
            PaymentOutcome::Succeeded => OrderStatus::Completed,
            PaymentOutcome::Failed => OrderStatus::PaymentFailed,
        };

        // The update is CAS-guarded; losing a race to another terminal
        // writer is the same no-op as the check above.
        if self.orders_repo.update_status(order_id, target).await? {
            info!(order_id, status = target.as_str(), "Order status updated from payment outcome");
        } else {
            info!(order_id, "Order reached a terminal state concurrently, ignoring");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_client::Product;
    use chrono::Utc;
    use model::{OrderItemRequest, PaymentTransaction};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// In-memory orders store mirroring the Postgres CAS semantics. Clones
    /// share the same rows, like pool-backed repositories share the store.
    #[derive(Default, Clone)]
    struct MemOrdersRepo {
        orders: Arc<Mutex<Vec<Order>>>,
    }

    #[async_trait]
    impl OrdersRepository for MemOrdersRepo {
        async fn insert(&self, order: &NewOrder) -> Result<Order, RepositoryError> {
            let mut orders = self.orders.lock().unwrap();
            let stored = Order {
                id: orders.len() as i64 + 1,
                user_email: order.user_email.clone(),
                lines: order.lines.clone(),
                total_price: order.total_price,
                status: order.status,
                created_at: order.created_at,
            };
            orders.push(stored.clone());
            Ok(stored)
        }

        async fn get_by_id(&self, id: i64) -> Result<Order, RepositoryError> {
            self.orders
                .lock()
                .unwrap()
                .iter()
                .find(|o| o.id == id)
                .cloned()
                .ok_or(RepositoryError::NotFound)
        }

        async fn list(&self) -> Result<Vec<Order>, RepositoryError> {
            Ok(self.orders.lock().unwrap().clone())
        }

        async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
            let mut orders = self.orders.lock().unwrap();
            let before = orders.len();
            orders.retain(|o| o.id != id);
            if orders.len() == before {
                return Err(RepositoryError::NotFound);
            }
            Ok(())
        }

        async fn update_status(
            &self,
            id: i64,
            status: OrderStatus,
        ) -> Result<bool, RepositoryError> {
            let mut orders = self.orders.lock().unwrap();
            for order in orders.iter_mut() {
                if order.id == id && !order.status.is_terminal() {
                    order.status = status;
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }

    enum CatalogMode {
        Prices(HashMap<String, f64>),
        Down,
    }

    struct StubCatalog {
        mode: CatalogMode,
    }

    #[async_trait]
    impl CatalogClient for StubCatalog {
        async fn get_product(&self, product_id: &str) -> Result<Product, CatalogError> {
            match &self.mode {
                CatalogMode::Down => Err(CatalogError::Communication("connection refused".into())),
                CatalogMode::Prices(prices) => prices
                    .get(product_id)
                    .map(|price| Product {
                        id: product_id.to_string(),
                        price: *price,
                    })
                    .ok_or_else(|| CatalogError::NotFound(product_id.to_string())),
            }
        }
    }

    enum PaymentMode {
        Created,
        Declined(&'static str),
        Communication(&'static str),
        Invalid(&'static str),
    }

    struct StubPayments {
        mode: PaymentMode,
        requests: Mutex<Vec<PaymentRequest>>,
    }

    impl StubPayments {
        fn new(mode: PaymentMode) -> Self {
            Self {
                mode,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn transaction(request: &PaymentRequest, status: model::PaymentStatus) -> PaymentTransaction {
            PaymentTransaction {
                id: 1,
                order_id: request.order_id,
                provider_transaction_id: Some("pi_test".to_string()),
                amount: request.amount,
                currency: request.currency.clone(),
                status,
                error_message: None,
                created_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl PaymentService for StubPayments {
        async fn process_payment(
            &self,
            request: &PaymentRequest,
        ) -> Result<PaymentAttempt, PaymentError> {
            self.requests.lock().unwrap().push(request.clone());
            match &self.mode {
                PaymentMode::Created => Ok(PaymentAttempt::Created(Self::transaction(
                    request,
                    model::PaymentStatus::Created,
                ))),
                PaymentMode::Declined(reason) => Ok(PaymentAttempt::Declined {
                    transaction: Self::transaction(request, model::PaymentStatus::Failed),
                    reason: reason.to_string(),
                }),
                PaymentMode::Communication(msg) => {
                    Err(PaymentError::Communication(msg.to_string()))
                }
                PaymentMode::Invalid(msg) => Err(PaymentError::Invalid(msg.to_string())),
            }
        }

        async fn handle_event(
            &self,
            _event: &model::NormalizedPaymentEvent,
        ) -> Result<(), PaymentError> {
            unimplemented!("not used by the orchestrator")
        }
    }

    fn catalog_with(prices: &[(&str, f64)]) -> StubCatalog {
        StubCatalog {
            mode: CatalogMode::Prices(
                prices
                    .iter()
                    .map(|(id, price)| (id.to_string(), *price))
                    .collect(),
            ),
        }
    }

    fn request(items: &[(&str, i32)]) -> CreateOrderRequest {
        CreateOrderRequest {
            items: items
                .iter()
                .map(|(id, quantity)| OrderItemRequest {
                    product_id: id.to_string(),
                    quantity: *quantity,
                })
                .collect(),
            payment_method_token: "tok_visa".to_string(),
        }
    }

    fn service(
        catalog: StubCatalog,
        payments: StubPayments,
    ) -> OrderServiceImpl<MemOrdersRepo, StubCatalog, StubPayments> {
        OrderServiceImpl::new(MemOrdersRepo::default(), catalog, payments, "EUR")
    }

    #[tokio::test]
    async fn test_create_order_prices_lines_and_creates_intent() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Created),
        );

        let order = svc
            .create_order("buyer@example.com", &request(&[("P1", 2)]))
            .await
            .unwrap();

        assert_eq!(order.total_price, 20.0);
        assert_eq!(order.status, OrderStatus::PaymentIntentCreated);
        assert_eq!(order.lines[0].price_at_order, 10.0);

        let stored = svc.get_order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::PaymentIntentCreated);

        let requests = svc.payments.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, 20.0);
        assert_eq!(requests[0].currency, "EUR");
    }

    #[tokio::test]
    async fn test_unknown_product_aborts_without_persisting() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Created),
        );

        let err = svc
            .create_order("buyer@example.com", &request(&[("P9", 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::ProductNotFound(ref id) if id == "P9"));
        assert!(svc.orders_repo.orders.lock().unwrap().is_empty());
        assert!(svc.payments.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catalog_down_aborts_without_persisting() {
        let svc = service(
            StubCatalog { mode: CatalogMode::Down },
            StubPayments::new(PaymentMode::Created),
        );

        let err = svc
            .create_order("buyer@example.com", &request(&[("P1", 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::CatalogUnavailable(_)));
        assert!(svc.orders_repo.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_positive_quantity_rejected() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Created),
        );

        let err = svc
            .create_order("buyer@example.com", &request(&[("P1", 0)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::InvalidOrder(_)));
        assert!(svc.orders_repo.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_positive_price_rejected() {
        let svc = service(
            catalog_with(&[("FREEBIE", 0.0)]),
            StubPayments::new(PaymentMode::Created),
        );

        let err = svc
            .create_order("buyer@example.com", &request(&[("FREEBIE", 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::InvalidOrder(_)));
        assert!(svc.orders_repo.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_decline_marks_order_and_fails() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Declined("card declined")),
        );

        let err = svc
            .create_order("buyer@example.com", &request(&[("P1", 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::PaymentDeclined(_)));
        // The order row is retained with the terminal sync-failure status.
        let stored = svc.get_order(1).await.unwrap();
        assert_eq!(stored.status, OrderStatus::PaymentFailedSync);
    }

    #[tokio::test]
    async fn test_payment_communication_failure_marks_order() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Communication("timeout")),
        );

        let err = svc
            .create_order("buyer@example.com", &request(&[("P1", 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::PaymentUnavailable(_)));
        let stored = svc.get_order(1).await.unwrap();
        assert_eq!(stored.status, OrderStatus::PaymentErrorCommunication);
    }

    #[tokio::test]
    async fn test_payment_client_error_marks_order() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Invalid("bad token")),
        );

        let err = svc
            .create_order("buyer@example.com", &request(&[("P1", 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::PaymentRejected(_)));
        let stored = svc.get_order(1).await.unwrap();
        assert_eq!(stored.status, OrderStatus::PaymentErrorClient);
    }

    /// Payment stub that settles the order through the store before
    /// returning, like a webhook racing the orchestrator.
    struct SettlingPayments {
        repo: MemOrdersRepo,
    }

    #[async_trait]
    impl PaymentService for SettlingPayments {
        async fn process_payment(
            &self,
            request: &PaymentRequest,
        ) -> Result<PaymentAttempt, PaymentError> {
            self.repo
                .update_status(request.order_id, OrderStatus::Completed)
                .await
                .unwrap();
            Ok(PaymentAttempt::Created(StubPayments::transaction(
                request,
                model::PaymentStatus::Created,
            )))
        }

        async fn handle_event(
            &self,
            _event: &model::NormalizedPaymentEvent,
        ) -> Result<(), PaymentError> {
            unimplemented!("not used by the orchestrator")
        }
    }

    #[tokio::test]
    async fn test_concurrent_settlement_wins_over_intent_status() {
        let repo = MemOrdersRepo::default();
        let svc = OrderServiceImpl::new(
            repo.clone(),
            catalog_with(&[("P1", 10.0)]),
            SettlingPayments { repo },
            "EUR",
        );

        let order = svc
            .create_order("buyer@example.com", &request(&[("P1", 1)]))
            .await
            .unwrap();

        // The store already holds the settled status; the response must not
        // report the intent status it failed to write.
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(
            svc.get_order(order.id).await.unwrap().status,
            OrderStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_payment_outcome_completes_order_once() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Created),
        );
        let order = svc
            .create_order("buyer@example.com", &request(&[("P1", 2)]))
            .await
            .unwrap();

        svc.apply_payment_outcome(order.id, PaymentOutcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(svc.get_order(order.id).await.unwrap().status, OrderStatus::Completed);

        // Duplicate delivery must not resurrect or change the terminal state.
        svc.apply_payment_outcome(order.id, PaymentOutcome::Failed)
            .await
            .unwrap();
        assert_eq!(svc.get_order(order.id).await.unwrap().status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_outcome_marks_order_failed() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Created),
        );
        let order = svc
            .create_order("buyer@example.com", &request(&[("P1", 1)]))
            .await
            .unwrap();

        svc.apply_payment_outcome(order.id, PaymentOutcome::Failed)
            .await
            .unwrap();
        assert_eq!(
            svc.get_order(order.id).await.unwrap().status,
            OrderStatus::PaymentFailed
        );
    }

    #[tokio::test]
    async fn test_outcome_for_unknown_order_is_not_found() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Created),
        );
        let err = svc
            .apply_payment_outcome(999, PaymentOutcome::Succeeded)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound));
    }

    #[tokio::test]
    async fn test_delete_order() {
        let svc = service(
            catalog_with(&[("P1", 10.0)]),
            StubPayments::new(PaymentMode::Created),
        );
        let order = svc
            .create_order("buyer@example.com", &request(&[("P1", 1)]))
            .await
            .unwrap();

        svc.delete_order(order.id).await.unwrap();
        assert!(matches!(
            svc.get_order(order.id).await.unwrap_err(),
            ServiceError::NotFound
        ));
        assert!(matches!(
            svc.delete_order(order.id).await.unwrap_err(),
            ServiceError::NotFound
        ));
    }
}
