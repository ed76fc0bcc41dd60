//! Settlement state machine.
//!
//! A gateway record moves `pending -> paid` or `pending -> failed` exactly
//! once. Every transition is a single conditional write in the record store;
//! a delivery that loses the race, or arrives after the record is terminal,
//! changes nothing and does not call the order collaborator again.
//!
//! COD records start in `unpaid` and are never advanced here.

use crate::database::error::DatabaseError;
use crate::database::payment_record_repository::PaymentRecordStore;
use crate::logging::mask_reference;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::order::OrderCollaborator;
use crate::payments::types::{
    NewPaymentRecord, OrderStatus, PaymentMethod, PaymentRecord, PaymentStatus,
};
use crate::payments::verifier::{Verification, VerifiedCallback};
use bigdecimal::{BigDecimal, Zero};
use chrono::{Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// How long one delivery owns the order update before another may take over
const ORDER_SYNC_LEASE_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    /// This delivery moved the record to `paid`
    Paid(PaymentRecord),
    /// Nothing changed; the record or its order was already settled
    Duplicate(PaymentRecord),
    /// The callback was refused. `record` is the stored state afterwards.
    Rejected {
        error: PaymentError,
        record: Option<PaymentRecord>,
    },
}

impl SettlementOutcome {
    pub fn record(&self) -> Option<&PaymentRecord> {
        match self {
            SettlementOutcome::Paid(record) | SettlementOutcome::Duplicate(record) => Some(record),
            SettlementOutcome::Rejected { record, .. } => record.as_ref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodConfirmation {
    pub record: PaymentRecord,
    /// False when an earlier confirmation already created the record
    pub created: bool,
}

pub struct SettlementCoordinator {
    records: Arc<dyn PaymentRecordStore>,
    orders: Arc<dyn OrderCollaborator>,
    currency: String,
}

impl SettlementCoordinator {
    pub fn new(
        records: Arc<dyn PaymentRecordStore>,
        orders: Arc<dyn OrderCollaborator>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            records,
            orders,
            currency: currency.into(),
        }
    }

    /// Apply a verified (or rejected) callback.
    ///
    /// Returns `Err` only when storage stays unavailable after one retry; the
    /// record is then left `pending` for reconciliation.
    pub async fn settle(&self, verification: Verification) -> PaymentResult<SettlementOutcome> {
        match verification {
            Verification::Authentic(callback) if callback.is_success() => {
                self.settle_success(callback).await
            }
            Verification::Authentic(callback) => self.settle_gateway_failure(callback).await,
            Verification::Unknown { reference } => {
                warn!(
                    transaction_reference = %mask_reference(&reference),
                    "No payment record to fail for unknown reference"
                );
                Ok(SettlementOutcome::Rejected {
                    error: PaymentError::UnknownTransactionReference { reference },
                    record: None,
                })
            }
            Verification::Forged {
                reason,
                reference,
                record,
                gateway_transaction_no,
            } => {
                let error = reason.into_error(&reference);
                let record = match record {
                    Some(record) if record.status == PaymentStatus::Pending => Some(
                        self.fail(&reference, &error, gateway_transaction_no.as_deref())
                            .await?
                            .unwrap_or(record),
                    ),
                    other => other,
                };
                Ok(SettlementOutcome::Rejected { error, record })
            }
        }
    }

    #[instrument(skip(self, callback), fields(transaction_reference = %mask_reference(callback.reference())))]
    async fn settle_success(&self, callback: VerifiedCallback) -> PaymentResult<SettlementOutcome> {
        let reference = callback.reference().to_string();
        let paid_at = Utc::now();
        let transaction_no = callback.gateway_transaction_no.as_deref();

        let applied = self
            .with_one_retry("mark_paid", &reference, || {
                self.records.mark_paid(&reference, transaction_no, paid_at)
            })
            .await?;

        if let Some(record) = applied {
            info!(
                order_id = %record.order_id,
                payment_id = %record.id,
                "Payment settled"
            );
            let record = self.sync_order(record).await;
            return Ok(SettlementOutcome::Paid(record));
        }

        let current = self.current(&reference).await?;
        match current.status {
            PaymentStatus::Paid if current.order_synced_at.is_none() => {
                let now = Utc::now();
                let claimed = self
                    .records
                    .claim_order_sync(
                        &reference,
                        now,
                        now - Duration::seconds(ORDER_SYNC_LEASE_SECS),
                    )
                    .await?;
                if !claimed {
                    info!(order_id = %current.order_id, "Order update already in progress");
                    return Ok(SettlementOutcome::Duplicate(current));
                }
                info!(order_id = %current.order_id, "Retrying order update for paid record");
                Ok(SettlementOutcome::Duplicate(self.sync_order(current).await))
            }
            PaymentStatus::Pending => {
                error!(
                    order_id = %current.order_id,
                    payment_id = %current.id,
                    "Gateway charged a second attempt for an order that is already paid; needs manual refund"
                );
                Ok(SettlementOutcome::Duplicate(current))
            }
            PaymentStatus::Failed => {
                error!(
                    order_id = %current.order_id,
                    payment_id = %current.id,
                    failure_reason = current.failure_reason.as_deref().unwrap_or(""),
                    "Gateway charged an attempt already marked failed; needs manual reconciliation"
                );
                Ok(SettlementOutcome::Duplicate(current))
            }
            _ => {
                info!(status = %current.status, "Duplicate callback ignored");
                Ok(SettlementOutcome::Duplicate(current))
            }
        }
    }

    #[instrument(skip(self, callback), fields(transaction_reference = %mask_reference(callback.reference())))]
    async fn settle_gateway_failure(
        &self,
        callback: VerifiedCallback,
    ) -> PaymentResult<SettlementOutcome> {
        let reference = callback.reference().to_string();
        let error = PaymentError::GatewayReportedFailure {
            reference: reference.clone(),
            response_code: callback.response_code.clone(),
        };

        match self
            .fail(&reference, &error, callback.gateway_transaction_no.as_deref())
            .await?
        {
            Some(record) => {
                info!(
                    response_code = %callback.response_code,
                    order_id = %record.order_id,
                    "Gateway reported payment failure"
                );
                Ok(SettlementOutcome::Rejected {
                    error,
                    record: Some(record),
                })
            }
            None => Ok(SettlementOutcome::Duplicate(self.current(&reference).await?)),
        }
    }

    /// `pending -> failed`; `None` when the record was no longer pending
    async fn fail(
        &self,
        reference: &str,
        error: &PaymentError,
        transaction_no: Option<&str>,
    ) -> PaymentResult<Option<PaymentRecord>> {
        let reason = error.reason_code();
        self.with_one_retry("mark_failed", reference, || {
            self.records.mark_failed(reference, reason, transaction_no)
        })
        .await
    }

    /// Ask the order collaborator for `paid` and remember that it accepted.
    /// The caller must hold the sync claim. Failures are logged and the claim
    /// is released so the next delivery retries.
    async fn sync_order(&self, record: PaymentRecord) -> PaymentRecord {
        let reference = record.transaction_reference.clone().unwrap_or_default();

        if let Err(e) = self.orders.set_status(&record.order_id, OrderStatus::Paid).await {
            error!(
                order_id = %record.order_id,
                error = %e,
                "Order status update failed after payment was recorded"
            );
            if let Err(e) = self.records.release_order_sync(&reference).await {
                warn!(
                    order_id = %record.order_id,
                    error = %e,
                    "Could not release order sync claim; it expires on its own"
                );
            }
            return record;
        }

        let synced_at = Utc::now();
        match self.records.mark_order_synced(&reference, synced_at).await {
            Ok(_) => PaymentRecord {
                order_synced_at: record.order_synced_at.or(Some(synced_at)),
                ..record
            },
            Err(e) => {
                warn!(
                    order_id = %record.order_id,
                    error = %e,
                    "Could not record order sync"
                );
                record
            }
        }
    }

    async fn current(&self, reference: &str) -> PaymentResult<PaymentRecord> {
        self.records
            .find_by_reference(reference)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound {
                reference: reference.to_string(),
            })
    }

    async fn with_one_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        reference: &str,
        mut attempt: F,
    ) -> PaymentResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        match attempt().await {
            Ok(value) => Ok(value),
            Err(first) => {
                warn!(
                    operation,
                    transaction_reference = %mask_reference(reference),
                    error = %first,
                    "Storage error during settlement, retrying once"
                );
                attempt().await.map_err(|second| {
                    error!(
                        operation,
                        transaction_reference = %mask_reference(reference),
                        error = %second,
                        "Settlement left pending for manual reconciliation"
                    );
                    PaymentError::SettlementFailed {
                        message: format!("{} failed: {}", operation, second),
                    }
                })
            }
        }
    }

    /// Create the `unpaid` record for a cash-on-delivery order.
    /// Repeating the call returns the record created the first time.
    #[instrument(skip(self))]
    pub async fn confirm_cod(&self, order_id: &str) -> PaymentResult<CodConfirmation> {
        let order = self
            .orders
            .resolve(order_id)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        if order.payment_method != PaymentMethod::Cod {
            warn!(declared = %order.payment_method, "COD confirmation refused");
            return Err(PaymentError::PaymentMethodMismatch {
                order_id: order.order_id,
                declared: order.payment_method,
                requested: PaymentMethod::Cod,
            });
        }

        if order.total <= BigDecimal::zero() {
            return Err(PaymentError::InvalidAmount {
                amount: order.total.to_string(),
            });
        }

        if let Some(record) = self.existing_cod(order_id).await? {
            return Ok(CodConfirmation {
                record,
                created: false,
            });
        }

        let inserted = self
            .records
            .insert(NewPaymentRecord {
                order_id: order.order_id.clone(),
                method: PaymentMethod::Cod,
                status: PaymentStatus::Unpaid,
                amount: order.total,
                currency: self.currency.clone(),
                transaction_reference: None,
            })
            .await;

        match inserted {
            Ok(record) => {
                info!(payment_id = %record.id, "COD payment recorded");
                Ok(CodConfirmation {
                    record,
                    created: true,
                })
            }
            // A concurrent confirmation won the insert
            Err(e) if e.is_constraint_violation() => match self.existing_cod(order_id).await? {
                Some(record) => Ok(CodConfirmation {
                    record,
                    created: false,
                }),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn existing_cod(&self, order_id: &str) -> PaymentResult<Option<PaymentRecord>> {
        Ok(self
            .records
            .find_by_order(order_id)
            .await?
            .into_iter()
            .find(|r| r.method == PaymentMethod::Cod))
    }
}
