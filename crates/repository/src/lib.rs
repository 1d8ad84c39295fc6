//! # Data Repository Layer
//!
//! This module provides repository traits and PostgreSQL implementations
//! for the two durable aggregates of the payment saga: orders (with their
//! lines) and payment transactions.
//!
//! Status updates are single-statement compare-and-set queries guarded by
//! the terminal-state sets, which serializes the synchronous and the
//! webhook-driven writer on the same row without any extra locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, PoolError};
use model::{NewOrder, NewPaymentTransaction, Order, OrderLine, OrderStatus, PaymentStatus, PaymentTransaction};
use thiserror::Error;
use tokio_postgres::Row;

/// # RepositoryError
///
/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a database connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// A stored status column holds a value outside the known enum.
    #[error("Invalid stored status: {0}")]
    InvalidStatus(String),
}

/// # OrdersRepository
///
/// Repository interface for the order aggregate (order row plus its lines).
///
/// Implementations must persist an order and its lines atomically and must
/// enforce the forward-only status machine on update.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    /// Atomically insert the order and its lines; returns the stored order
    /// with its generated identifier.
    async fn insert(&self, order: &NewOrder) -> Result<Order, RepositoryError>;

    /// Get the full order (lines included) by id.
    async fn get_by_id(&self, id: i64) -> Result<Order, RepositoryError>;

    /// List all orders with their lines.
    async fn list(&self) -> Result<Vec<Order>, RepositoryError>;

    /// Delete an order (lines cascade). `NotFound` if the id is unknown.
    async fn delete(&self, id: i64) -> Result<(), RepositoryError>;

    /// Compare-and-set status update: only succeeds while the stored status
    /// is still non-terminal. Returns `false` when no row was updated
    /// (unknown id, or the order already reached a terminal state).
    async fn update_status(&self, id: i64, status: OrderStatus) -> Result<bool, RepositoryError>;
}

/// PostgreSQL implementation of the OrdersRepository trait.
pub struct PgOrdersRepository {
    /// Connection pool for database operations
    pool: Pool,
}

impl PgOrdersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn order_from_row(row: &Row, lines: Vec<OrderLine>) -> Result<Order, RepositoryError> {
        let status_text: String = row.get("status");
        let status = OrderStatus::parse(&status_text)
            .ok_or_else(|| RepositoryError::InvalidStatus(status_text))?;
        let created_at: DateTime<Utc> = row.get("created_at");
        Ok(Order {
            id: row.get("id"),
            user_email: row.get("user_email"),
            lines,
            total_price: row.get("total_price"),
            status,
            created_at,
        })
    }

    async fn lines_for_order(
        &self,
        conn: &deadpool_postgres::Object,
        order_id: i64,
    ) -> Result<Vec<OrderLine>, RepositoryError> {
        let query = r#"
            SELECT product_id, quantity, price_at_order
            FROM order_lines WHERE order_id = $1 ORDER BY id
        "#;
        let rows = conn.query(query, &[&order_id]).await?;
        Ok(rows
            .into_iter()
            .map(|row| OrderLine {
                product_id: row.get("product_id"),
                quantity: row.get("quantity"),
                price_at_order: row.get("price_at_order"),
            })
            .collect())
    }
}

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    async fn insert(&self, order: &NewOrder) -> Result<Order, RepositoryError> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let query = r#"
            INSERT INTO orders (user_email, total_price, status, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
        "#;
        let row = tx
            .query_one(
                query,
                &[
                    &order.user_email,
                    &order.total_price,
                    &order.status.as_str(),
                    &order.created_at,
                ],
            )
            .await?;
        let id: i64 = row.get("id");

        let line_query = r#"
            INSERT INTO order_lines (order_id, product_id, quantity, price_at_order)
            VALUES ($1, $2, $3, $4)
        "#;
        for line in &order.lines {
            tx.execute(
                line_query,
                &[&id, &line.product_id, &line.quantity, &line.price_at_order],
            )
            .await?;
        }

        tx.commit().await?;

        Ok(Order {
            id,
            user_email: order.user_email.clone(),
            lines: order.lines.clone(),
            total_price: order.total_price,
            status: order.status,
            created_at: order.created_at,
        })
    }

    async fn get_by_id(&self, id: i64) -> Result<Order, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            SELECT id, user_email, total_price, status, created_at
            FROM orders WHERE id = $1
        "#;
        let row = conn.query_opt(query, &[&id]).await?;
        match row {
            Some(row) => {
                let lines = self.lines_for_order(&conn, id).await?;
                Self::order_from_row(&row, lines)
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list(&self) -> Result<Vec<Order>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            SELECT id, user_email, total_price, status, created_at
            FROM orders ORDER BY id
        "#;
        let rows = conn.query(query, &[]).await?;
        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let lines = self.lines_for_order(&conn, id).await?;
            orders.push(Self::order_from_row(&row, lines)?);
        }
        Ok(orders)
    }

    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        let conn = self.pool.get().await?;
        let affected = conn
            .execute("DELETE FROM orders WHERE id = $1", &[&id])
            .await?;
        if affected == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_status(&self, id: i64, status: OrderStatus) -> Result<bool, RepositoryError> {
        let conn = self.pool.get().await?;
        // Guarded by the non-terminal set: a late writer cannot clobber an
        // order that already reached a terminal state.
        let query = r#"
            UPDATE orders SET status = $2
            WHERE id = $1 AND status IN ('PENDING_PAYMENT', 'PAYMENT_INTENT_CREATED')
        "#;
        let affected = conn.execute(query, &[&id, &status.as_str()]).await?;
        Ok(affected == 1)
    }
}

/// # PaymentTransactionsRepository
///
/// Repository interface for payment transactions. A transaction is keyed by
/// a generated id but carries two unique references: `order_id` (at most one
/// transaction per order) and `provider_transaction_id` (the provider's own
/// identifier, set once the provider responds).
#[async_trait]
pub trait PaymentTransactionsRepository: Send + Sync {
    /// Insert a transaction row. Re-running the payment step for an order
    /// that already has a row returns the existing row unchanged instead of
    /// creating a second one.
    async fn insert(
        &self,
        tx: &NewPaymentTransaction,
    ) -> Result<PaymentTransaction, RepositoryError>;

    /// Get the transaction for an order.
    async fn get_by_order_id(&self, order_id: i64) -> Result<PaymentTransaction, RepositoryError>;

    /// Look up a transaction by the provider's identifier. `None` for ids
    /// this system never tracked.
    async fn get_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>, RepositoryError>;

    /// Compare-and-set finalize keyed by provider transaction id: moves a
    /// still-open row to the given terminal status and returns its order id.
    /// `None` when nothing was updated: either the id is unknown or the row
    /// is already terminal (duplicate delivery).
    async fn finalize(
        &self,
        provider_transaction_id: &str,
        status: PaymentStatus,
        error_message: Option<&str>,
    ) -> Result<Option<i64>, RepositoryError>;
}

/// PostgreSQL implementation of the PaymentTransactionsRepository trait.
pub struct PgPaymentTransactionsRepository {
    /// Connection pool for database operations
    pool: Pool,
}

impl PgPaymentTransactionsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn transaction_from_row(row: &Row) -> Result<PaymentTransaction, RepositoryError> {
        let status_text: String = row.get("status");
        let status = PaymentStatus::parse(&status_text)
            .ok_or_else(|| RepositoryError::InvalidStatus(status_text))?;
        let created_at: DateTime<Utc> = row.get("created_at");
        Ok(PaymentTransaction {
            id: row.get("id"),
            order_id: row.get("order_id"),
            provider_transaction_id: row.get("provider_transaction_id"),
            amount: row.get("amount"),
            currency: row.get("currency"),
            status,
            error_message: row.get("error_message"),
            created_at,
        })
    }
}

const TRANSACTION_COLUMNS: &str =
    "id, order_id, provider_transaction_id, amount, currency, status, error_message, created_at";

#[async_trait]
impl PaymentTransactionsRepository for PgPaymentTransactionsRepository {
    async fn insert(
        &self,
        tx: &NewPaymentTransaction,
    ) -> Result<PaymentTransaction, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            r#"
            INSERT INTO payment_transactions
                (order_id, provider_transaction_id, amount, currency, status, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id) DO NOTHING
            RETURNING {TRANSACTION_COLUMNS}
            "#
        );
        let row = conn
            .query_opt(
                &query,
                &[
                    &tx.order_id,
                    &tx.provider_transaction_id,
                    &tx.amount,
                    &tx.currency,
                    &tx.status.as_str(),
                    &tx.error_message,
                    &tx.created_at,
                ],
            )
            .await?;
        match row {
            Some(row) => Self::transaction_from_row(&row),
            // Conflict on the unique order_id: a transaction already exists
            // for this order, return it as-is.
            None => self.get_by_order_id(tx.order_id).await,
        }
    }

    async fn get_by_order_id(&self, order_id: i64) -> Result<PaymentTransaction, RepositoryError> {
        let conn = self.pool.get().await?;
        let query =
            format!("SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE order_id = $1");
        let row = conn.query_opt(&query, &[&order_id]).await?;
        match row {
            Some(row) => Self::transaction_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE provider_transaction_id = $1"
        );
        let row = conn.query_opt(&query, &[&provider_transaction_id]).await?;
        row.map(|row| Self::transaction_from_row(&row)).transpose()
    }

    async fn finalize(
        &self,
        provider_transaction_id: &str,
        status: PaymentStatus,
        error_message: Option<&str>,
    ) -> Result<Option<i64>, RepositoryError> {
        let conn = self.pool.get().await?;
        // Atomic CAS: only a still-open row is moved to a terminal status,
        // which makes duplicate webhook deliveries a no-op.
        let query = r#"
            UPDATE payment_transactions
            SET status = $2, error_message = COALESCE($3, error_message)
            WHERE provider_transaction_id = $1 AND status NOT IN ('SUCCEEDED', 'FAILED')
            RETURNING order_id
        "#;
        let row = conn
            .query_opt(query, &[&provider_transaction_id, &status.as_str(), &error_message])
            .await?;
        Ok(row.map(|row| row.get("order_id")))
    }
}
