//! Process-local payment record store.
//!
//! Mirrors the Postgres constraints (unique transaction reference, one COD
//! record per order, one paid record per order). Every conditional update
//! runs under a single write lock, which gives it the same compare-and-set
//! semantics as the SQL `UPDATE ... WHERE status = 'pending'`.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::payment_record_repository::PaymentRecordStore;
use crate::payments::types::{NewPaymentRecord, PaymentMethod, PaymentRecord, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryPaymentRecordStore {
    records: RwLock<HashMap<Uuid, PaymentRecord>>,
}

impl InMemoryPaymentRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn violation(constraint: &str, message: String) -> DatabaseError {
        DatabaseError::new(DatabaseErrorKind::ConstraintViolation {
            constraint: constraint.to_string(),
            message,
        })
    }

    fn locate<'a>(
        records: &'a mut HashMap<Uuid, PaymentRecord>,
        reference: &str,
    ) -> Option<&'a mut PaymentRecord> {
        records
            .values_mut()
            .find(|r| r.transaction_reference.as_deref() == Some(reference))
    }
}

#[async_trait]
impl PaymentRecordStore for InMemoryPaymentRecordStore {
    async fn insert(&self, record: NewPaymentRecord) -> Result<PaymentRecord, DatabaseError> {
        let mut records = self.records.write().await;

        if let Some(reference) = record.transaction_reference.as_deref() {
            if records
                .values()
                .any(|r| r.transaction_reference.as_deref() == Some(reference))
            {
                return Err(Self::violation(
                    "payment_records_transaction_reference_key",
                    format!("duplicate transaction reference {}", reference),
                ));
            }
        }
        if record.method == PaymentMethod::Cod
            && records
                .values()
                .any(|r| r.order_id == record.order_id && r.method == PaymentMethod::Cod)
        {
            return Err(Self::violation(
                "payment_records_one_cod_per_order",
                format!("order {} already has a COD record", record.order_id),
            ));
        }

        let now = Utc::now();
        let stored = PaymentRecord {
            id: Uuid::new_v4(),
            order_id: record.order_id,
            method: record.method,
            status: record.status,
            amount: record.amount,
            currency: record.currency,
            transaction_reference: record.transaction_reference,
            gateway_transaction_no: None,
            failure_reason: None,
            paid_at: None,
            order_synced_at: None,
            order_sync_claimed_at: None,
            created_at: now,
            updated_at: now,
        };
        records.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.transaction_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn find_by_order(&self, order_id: &str) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let mut found: Vec<PaymentRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn mark_paid(
        &self,
        reference: &str,
        gateway_transaction_no: Option<&str>,
        paid_at: DateTime<Utc>,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let mut records = self.records.write().await;

        let order_id = match records
            .values()
            .find(|r| r.transaction_reference.as_deref() == Some(reference))
        {
            Some(r) if r.status == PaymentStatus::Pending => r.order_id.clone(),
            _ => return Ok(None),
        };
        if records
            .values()
            .any(|r| r.order_id == order_id && r.status == PaymentStatus::Paid)
        {
            return Ok(None);
        }

        let Some(record) = Self::locate(&mut records, reference) else {
            return Ok(None);
        };
        record.status = PaymentStatus::Paid;
        record.paid_at = Some(paid_at);
        record.order_sync_claimed_at = Some(paid_at);
        if let Some(no) = gateway_transaction_no {
            record.gateway_transaction_no = Some(no.to_string());
        }
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn mark_failed(
        &self,
        reference: &str,
        reason: &str,
        gateway_transaction_no: Option<&str>,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let mut records = self.records.write().await;
        let Some(record) = Self::locate(&mut records, reference) else {
            return Ok(None);
        };
        if record.status != PaymentStatus::Pending {
            return Ok(None);
        }
        record.status = PaymentStatus::Failed;
        record.failure_reason = Some(reason.to_string());
        if let Some(no) = gateway_transaction_no {
            record.gateway_transaction_no = Some(no.to_string());
        }
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn mark_order_synced(
        &self,
        reference: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut records = self.records.write().await;
        match Self::locate(&mut records, reference) {
            Some(record)
                if record.status == PaymentStatus::Paid && record.order_synced_at.is_none() =>
            {
                record.order_synced_at = Some(synced_at);
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_order_sync(
        &self,
        reference: &str,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut records = self.records.write().await;
        match Self::locate(&mut records, reference) {
            Some(record)
                if record.status == PaymentStatus::Paid
                    && record.order_synced_at.is_none()
                    && record
                        .order_sync_claimed_at
                        .map_or(true, |held| held < stale_before) =>
            {
                record.order_sync_claimed_at = Some(claimed_at);
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_order_sync(&self, reference: &str) -> Result<(), DatabaseError> {
        let mut records = self.records.write().await;
        if let Some(record) = Self::locate(&mut records, reference) {
            if record.order_synced_at.is_none() {
                record.order_sync_claimed_at = None;
                record.updated_at = Utc::now();
            }
        }
        Ok(())
    }
}
