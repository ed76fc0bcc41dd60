//! Order collaborator: the only window this service has onto orders.
//!
//! Orders are owned by the surrounding storefront. Settlement reads an
//! order's total and declared payment method, and asks for the `paid`
//! transition; it never creates or edits orders otherwise.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::types::{OrderStatus, OrderSummary, PaymentMethod};
use async_trait::async_trait;
use sqlx::{types::BigDecimal, FromRow, PgPool};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait OrderCollaborator: Send + Sync {
    async fn resolve(&self, order_id: &str) -> Result<Option<OrderSummary>, DatabaseError>;

    /// Idempotent: asking for the status the order already has is a no-op.
    /// Returns whether the stored status changed.
    async fn set_status(&self, order_id: &str, status: OrderStatus)
        -> Result<bool, DatabaseError>;
}

#[derive(Debug, Clone, FromRow)]
struct OrderRow {
    id: String,
    total: BigDecimal,
    payment_method: String,
    status: String,
}

impl TryFrom<OrderRow> for OrderSummary {
    type Error = DatabaseError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let decode = |message: String| DatabaseError::new(DatabaseErrorKind::Decode { message });
        Ok(OrderSummary {
            payment_method: row
                .payment_method
                .parse::<PaymentMethod>()
                .map_err(|e| decode(format!("orders.{}: {}", row.id, e)))?,
            status: row
                .status
                .parse::<OrderStatus>()
                .map_err(|e| decode(format!("orders.{}: {}", row.id, e)))?,
            order_id: row.id,
            total: row.total,
        })
    }
}

/// Reads the storefront's `orders` table
pub struct PgOrderDirectory {
    pool: PgPool,
}

impl PgOrderDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderCollaborator for PgOrderDirectory {
    async fn resolve(&self, order_id: &str) -> Result<Option<OrderSummary>, DatabaseError> {
        sqlx::query_as::<_, OrderRow>(
            "SELECT id, total, payment_method, status FROM orders WHERE id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(OrderSummary::try_from)
        .transpose()
    }

    async fn set_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE orders
             SET status = $2, updated_at = NOW()
             WHERE id = $1 AND status IS DISTINCT FROM $2",
        )
        .bind(order_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }
}

/// In-process order directory for tests and for running without a database.
/// Counts effective status changes so callers can assert idempotence.
#[derive(Default)]
pub struct InMemoryOrderDirectory {
    orders: RwLock<HashMap<String, OrderSummary>>,
    status_requests: RwLock<Vec<(String, OrderStatus)>>,
}

impl InMemoryOrderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, order: OrderSummary) {
        self.orders
            .write()
            .await
            .insert(order.order_id.clone(), order);
    }

    pub async fn status_of(&self, order_id: &str) -> Option<OrderStatus> {
        self.orders.read().await.get(order_id).map(|o| o.status)
    }

    /// Every `set_status` call received, in order
    pub async fn status_requests(&self) -> Vec<(String, OrderStatus)> {
        self.status_requests.read().await.clone()
    }
}

#[async_trait]
impl OrderCollaborator for InMemoryOrderDirectory {
    async fn resolve(&self, order_id: &str) -> Result<Option<OrderSummary>, DatabaseError> {
        Ok(self.orders.read().await.get(order_id).cloned())
    }

    async fn set_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<bool, DatabaseError> {
        self.status_requests
            .write()
            .await
            .push((order_id.to_string(), status));

        let mut orders = self.orders.write().await;
        let order = orders.get_mut(order_id).ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            })
        })?;
        if order.status == status {
            return Ok(false);
        }
        order.status = status;
        Ok(true)
    }
}
