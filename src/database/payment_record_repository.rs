use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::types::{NewPaymentRecord, PaymentMethod, PaymentRecord, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::BigDecimal, FromRow, PgPool};
use uuid::Uuid;

/// Durable table of payment attempts.
///
/// Records are append/update-only. Status changes are compare-and-set writes
/// conditioned on the record still being `pending`, so a duplicate callback
/// can never apply twice.
#[async_trait]
pub trait PaymentRecordStore: Send + Sync {
    async fn insert(&self, record: NewPaymentRecord) -> Result<PaymentRecord, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError>;

    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    async fn find_by_order(&self, order_id: &str) -> Result<Vec<PaymentRecord>, DatabaseError>;

    /// `pending -> paid`. Returns the updated record only when this call made
    /// the transition; `None` means the record was not pending or another
    /// record of the same order is already paid.
    async fn mark_paid(
        &self,
        reference: &str,
        gateway_transaction_no: Option<&str>,
        paid_at: DateTime<Utc>,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// `pending -> failed`, same contract as [`PaymentRecordStore::mark_paid`].
    async fn mark_failed(
        &self,
        reference: &str,
        reason: &str,
        gateway_transaction_no: Option<&str>,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// Stamp `order_synced_at` once the order collaborator accepted `paid`.
    /// Returns false if it was already stamped.
    async fn mark_order_synced(
        &self,
        reference: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Take over the order update of a paid, unsynced record. Succeeds only
    /// when nobody holds the claim or the last claim is older than
    /// `stale_before`. `mark_paid` hands the claim to its caller.
    async fn claim_order_sync(
        &self,
        reference: &str,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Drop the claim after a failed order update so the next delivery retries
    async fn release_order_sync(&self, reference: &str) -> Result<(), DatabaseError>;
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentRecordRow {
    pub id: Uuid,
    pub order_id: String,
    pub method: String,
    pub status: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub transaction_reference: Option<String>,
    pub gateway_transaction_no: Option<String>,
    pub failure_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub order_synced_at: Option<DateTime<Utc>>,
    pub order_sync_claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRecordRow> for PaymentRecord {
    type Error = DatabaseError;

    fn try_from(row: PaymentRecordRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let decode = |e: crate::payments::error::PaymentError| {
            DatabaseError::new(DatabaseErrorKind::Decode {
                message: format!("payment_records.{}: {}", id, e),
            })
        };
        Ok(PaymentRecord {
            method: row.method.parse::<PaymentMethod>().map_err(decode)?,
            status: row.status.parse::<PaymentStatus>().map_err(decode)?,
            id,
            order_id: row.order_id,
            amount: row.amount,
            currency: row.currency,
            transaction_reference: row.transaction_reference,
            gateway_transaction_no: row.gateway_transaction_no,
            failure_reason: row.failure_reason,
            paid_at: row.paid_at,
            order_synced_at: row.order_synced_at,
            order_sync_claimed_at: row.order_sync_claimed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const RECORD_COLUMNS: &str = "id, order_id, method, status, amount, currency, \
     transaction_reference, gateway_transaction_no, failure_reason, paid_at, \
     order_synced_at, order_sync_claimed_at, created_at, updated_at";

/// Name of the partial unique index that allows a single paid record per order
const ONE_PAID_PER_ORDER: &str = "payment_records_one_paid_per_order";

/// Postgres-backed payment record store
pub struct PgPaymentRecordRepository {
    pool: PgPool,
}

impl PgPaymentRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn into_record(row: Option<PaymentRecordRow>) -> Result<Option<PaymentRecord>, DatabaseError> {
        row.map(PaymentRecord::try_from).transpose()
    }
}

#[async_trait]
impl PaymentRecordStore for PgPaymentRecordRepository {
    async fn insert(&self, record: NewPaymentRecord) -> Result<PaymentRecord, DatabaseError> {
        let sql = format!(
            "INSERT INTO payment_records
             (order_id, method, status, amount, currency, transaction_reference)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentRecordRow>(&sql)
            .bind(&record.order_id)
            .bind(record.method.as_str())
            .bind(record.status.as_str())
            .bind(&record.amount)
            .bind(&record.currency)
            .bind(&record.transaction_reference)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        PaymentRecord::try_from(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!("SELECT {} FROM payment_records WHERE id = $1", RECORD_COLUMNS);
        let row = sqlx::query_as::<_, PaymentRecordRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Self::into_record(row)
    }

    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM payment_records WHERE transaction_reference = $1",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentRecordRow>(&sql)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Self::into_record(row)
    }

    async fn find_by_order(&self, order_id: &str) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM payment_records WHERE order_id = $1 ORDER BY created_at ASC",
            RECORD_COLUMNS
        );
        sqlx::query_as::<_, PaymentRecordRow>(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(PaymentRecord::try_from)
            .collect()
    }

    async fn mark_paid(
        &self,
        reference: &str,
        gateway_transaction_no: Option<&str>,
        paid_at: DateTime<Utc>,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        // Single conditional write: no read-then-write window between
        // concurrent deliveries of the same callback.
        let sql = format!(
            "UPDATE payment_records AS pr
             SET status = 'paid',
                 paid_at = $2,
                 order_sync_claimed_at = $2,
                 gateway_transaction_no = COALESCE($3, pr.gateway_transaction_no),
                 updated_at = NOW()
             WHERE pr.transaction_reference = $1
               AND pr.status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM payment_records other
                   WHERE other.order_id = pr.order_id AND other.status = 'paid'
               )
             RETURNING {}",
            RECORD_COLUMNS
        );
        let result = sqlx::query_as::<_, PaymentRecordRow>(&sql)
            .bind(reference)
            .bind(paid_at)
            .bind(gateway_transaction_no)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx);

        match result {
            Ok(row) => Self::into_record(row),
            // Lost the race against another record of the same order
            Err(DatabaseError {
                kind: DatabaseErrorKind::ConstraintViolation { constraint, .. },
            }) if constraint == ONE_PAID_PER_ORDER => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn mark_failed(
        &self,
        reference: &str,
        reason: &str,
        gateway_transaction_no: Option<&str>,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "UPDATE payment_records
             SET status = 'failed',
                 failure_reason = $2,
                 gateway_transaction_no = COALESCE($3, gateway_transaction_no),
                 updated_at = NOW()
             WHERE transaction_reference = $1 AND status = 'pending'
             RETURNING {}",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentRecordRow>(&sql)
            .bind(reference)
            .bind(reason)
            .bind(gateway_transaction_no)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Self::into_record(row)
    }

    async fn mark_order_synced(
        &self,
        reference: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE payment_records
             SET order_synced_at = $2, updated_at = NOW()
             WHERE transaction_reference = $1
               AND status = 'paid'
               AND order_synced_at IS NULL",
        )
        .bind(reference)
        .bind(synced_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_order_sync(
        &self,
        reference: &str,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE payment_records
             SET order_sync_claimed_at = $2, updated_at = NOW()
             WHERE transaction_reference = $1
               AND status = 'paid'
               AND order_synced_at IS NULL
               AND (order_sync_claimed_at IS NULL OR order_sync_claimed_at < $3)",
        )
        .bind(reference)
        .bind(claimed_at)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_order_sync(&self, reference: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE payment_records
             SET order_sync_claimed_at = NULL, updated_at = NOW()
             WHERE transaction_reference = $1 AND order_synced_at IS NULL",
        )
        .bind(reference)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
