use crate::payments::error::PaymentError;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Response code the gateway uses for a successful charge
pub const GATEWAY_SUCCESS_CODE: &str = "00";

/// How an order is settled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Gateway,
    Cod,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Gateway => "gateway",
            PaymentMethod::Cod => "cod",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "gateway" | "vnpay" | "online" => Ok(PaymentMethod::Gateway),
            "cod" | "cash_on_delivery" => Ok(PaymentMethod::Cod),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported payment method: {}", value),
                field: Some("payment_method".to_string()),
            }),
        }
    }
}

/// Lifecycle of a single payment attempt.
///
/// `Pending` moves forward to exactly one of `Paid` / `Failed`. `Unpaid` is
/// the COD starting point; collection happens outside this service so it is
/// never advanced here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Unpaid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Unpaid => "unpaid",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Failed)
    }

    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        matches!(
            (self, target),
            (PaymentStatus::Pending, PaymentStatus::Paid)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "unpaid" => Ok(PaymentStatus::Unpaid),
            _ => Err(PaymentError::ValidationError {
                message: format!("unknown payment status: {}", value),
                field: Some("status".to_string()),
            }),
        }
    }
}

/// Order lifecycle as seen by this service. Only `Paid` is ever requested
/// from here; the other states belong to the surrounding platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Shipped,
    Delivered,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "failed" => Ok(OrderStatus::Failed),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "canceled" | "cancelled" => Ok(OrderStatus::Canceled),
            _ => Err(PaymentError::ValidationError {
                message: format!("unknown order status: {}", value),
                field: Some("status".to_string()),
            }),
        }
    }
}

/// What the order collaborator tells us about an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSummary {
    pub order_id: String,
    pub total: BigDecimal,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
}

/// Audit record of one payment attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: BigDecimal,
    pub currency: String,
    pub transaction_reference: Option<String>,
    pub gateway_transaction_no: Option<String>,
    pub failure_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub order_synced_at: Option<DateTime<Utc>>,
    /// Lease on the order update; whoever holds it is the only caller
    #[serde(skip)]
    pub order_sync_claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Amount in the gateway's minor-unit representation
    pub fn amount_minor_units(&self) -> String {
        to_minor_units(&self.amount)
    }
}

/// Insert payload; `id`, timestamps and terminal fields are server-generated
#[derive(Debug, Clone)]
pub struct NewPaymentRecord {
    pub order_id: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: BigDecimal,
    pub currency: String,
    pub transaction_reference: Option<String>,
}

/// Decimal places a payable amount may carry
pub const AMOUNT_SCALE: i64 = 2;

/// Gateway amounts are integers: the decimal amount times 100.
pub fn to_minor_units(amount: &BigDecimal) -> String {
    (amount * BigDecimal::from(100)).with_scale(0).to_string()
}

/// Whether `amount` converts to minor units without dropping digits
pub fn fits_minor_units(amount: &BigDecimal) -> bool {
    let (_, scale) = amount.normalized().as_bigint_and_exponent();
    scale <= AMOUNT_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_multiply_by_hundred() {
        let amount = BigDecimal::from_str("150000").unwrap();
        assert_eq!(to_minor_units(&amount), "15000000");

        let amount = BigDecimal::from_str("12.5").unwrap();
        assert_eq!(to_minor_units(&amount), "1250");
    }

    #[test]
    fn sub_cent_amounts_do_not_fit_minor_units() {
        for ok in ["150000", "12.5", "12.50", "12.340", "0.01"] {
            assert!(fits_minor_units(&BigDecimal::from_str(ok).unwrap()), "{}", ok);
        }
        for bad in ["12.345", "0.001"] {
            assert!(!fits_minor_units(&BigDecimal::from_str(bad).unwrap()), "{}", bad);
        }
    }

    #[test]
    fn only_pending_moves_forward() {
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Paid));
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Failed));
        assert!(!PaymentStatus::Paid.can_transition_to(PaymentStatus::Pending));
        assert!(!PaymentStatus::Failed.can_transition_to(PaymentStatus::Paid));
        assert!(!PaymentStatus::Unpaid.can_transition_to(PaymentStatus::Paid));
    }

    #[test]
    fn status_round_trips_through_db_strings() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Paid,
            PaymentStatus::Failed,
            PaymentStatus::Unpaid,
        ] {
            assert_eq!(PaymentStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(PaymentStatus::from_str("refunded").is_err());
    }

    #[test]
    fn payment_method_serializes_snake_case() {
        let json = serde_json::to_value(PaymentMethod::Cod).unwrap();
        assert_eq!(json, "cod");
        assert_eq!(PaymentMethod::from_str("GATEWAY").unwrap(), PaymentMethod::Gateway);
    }
}
