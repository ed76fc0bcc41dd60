use crate::database::error::DatabaseError;
use crate::payments::types::{OrderStatus, PaymentMethod};
use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Invalid amount: {amount}")]
    InvalidAmount { amount: String },

    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("Order {order_id} is settled by {declared}, not {requested}")]
    PaymentMethodMismatch {
        order_id: String,
        declared: PaymentMethod,
        requested: PaymentMethod,
    },

    #[error("Order {order_id} is {status} and cannot be paid")]
    OrderNotPayable {
        order_id: String,
        status: OrderStatus,
    },

    #[error("Payment not found: {reference}")]
    PaymentNotFound { reference: String },

    #[error("Signature mismatch for transaction {reference}")]
    SignatureMismatch { reference: String },

    /// Reported amount differs from the stored one; treated like a forged signature
    #[error("Amount mismatch for transaction {reference}: expected {expected}, reported {reported}")]
    AmountMismatch {
        reference: String,
        expected: String,
        reported: String,
    },

    #[error("Unknown transaction reference: {reference}")]
    UnknownTransactionReference { reference: String },

    #[error("Gateway reported failure: reference={reference}, code={response_code}")]
    GatewayReportedFailure {
        reference: String,
        response_code: String,
    },

    #[error("Storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("Settlement failed: {message}")]
    SettlementFailed { message: String },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Storage { retryable, .. } => *retryable,
            PaymentError::SettlementFailed { .. } => true,
            _ => false,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ConfigurationError { .. } => 500,
            PaymentError::ValidationError { .. } => 400,
            PaymentError::InvalidAmount { .. } => 400,
            PaymentError::OrderNotFound { .. } => 404,
            PaymentError::PaymentMethodMismatch { .. } => 409,
            PaymentError::OrderNotPayable { .. } => 409,
            PaymentError::PaymentNotFound { .. } => 404,
            PaymentError::SignatureMismatch { .. } => 400,
            PaymentError::AmountMismatch { .. } => 400,
            PaymentError::UnknownTransactionReference { .. } => 404,
            PaymentError::GatewayReportedFailure { .. } => 402,
            PaymentError::Storage { .. } => 503,
            PaymentError::SettlementFailed { .. } => 503,
        }
    }

    /// Short code carried on the failure redirect and in logs
    pub fn reason_code(&self) -> &'static str {
        match self {
            PaymentError::ConfigurationError { .. } => "configuration_error",
            PaymentError::ValidationError { .. } => "invalid_request",
            PaymentError::InvalidAmount { .. } => "invalid_amount",
            PaymentError::OrderNotFound { .. } => "order_not_found",
            PaymentError::PaymentMethodMismatch { .. } => "payment_method_mismatch",
            PaymentError::OrderNotPayable { .. } => "order_not_payable",
            PaymentError::PaymentNotFound { .. } => "payment_not_found",
            PaymentError::SignatureMismatch { .. } => "signature_mismatch",
            PaymentError::AmountMismatch { .. } => "amount_mismatch",
            PaymentError::UnknownTransactionReference { .. } => "unknown_transaction",
            PaymentError::GatewayReportedFailure { .. } => "gateway_failure",
            PaymentError::Storage { .. } => "storage_error",
            PaymentError::SettlementFailed { .. } => "settlement_failed",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::InvalidAmount { .. } => "Payment amount must be greater than zero with at most two decimal places".to_string(),
            PaymentError::OrderNotFound { order_id } => format!("Order '{}' not found", order_id),
            PaymentError::PaymentMethodMismatch { declared, .. } => {
                format!("Order must be settled by {}", declared)
            }
            PaymentError::OrderNotPayable { status, .. } => {
                format!("Order is already {}", status)
            }
            PaymentError::PaymentNotFound { reference } => {
                format!("Payment '{}' not found", reference)
            }
            PaymentError::SignatureMismatch { .. } | PaymentError::AmountMismatch { .. } => {
                "Invalid payment signature".to_string()
            }
            PaymentError::UnknownTransactionReference { .. } => {
                "Unknown payment transaction".to_string()
            }
            PaymentError::GatewayReportedFailure { .. } => {
                "Payment was not completed at the gateway".to_string()
            }
            PaymentError::ConfigurationError { .. }
            | PaymentError::Storage { .. }
            | PaymentError::SettlementFailed { .. } => {
                "Payment service is temporarily unavailable".to_string()
            }
        }
    }
}

impl From<DatabaseError> for PaymentError {
    fn from(err: DatabaseError) -> Self {
        PaymentError::Storage {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{
            AppError, AppErrorKind, DomainError, InfrastructureError, ValidationError,
        };

        let kind = match &err {
            PaymentError::ConfigurationError { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration {
                    message: message.clone(),
                })
            }
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.clone().unwrap_or_else(|| "request".to_string()),
                    reason: message.clone(),
                })
            }
            PaymentError::InvalidAmount { amount } => {
                AppErrorKind::Domain(DomainError::InvalidAmount {
                    amount: amount.clone(),
                })
            }
            PaymentError::OrderNotFound { order_id } => {
                AppErrorKind::Domain(DomainError::OrderNotFound {
                    order_id: order_id.clone(),
                })
            }
            PaymentError::PaymentMethodMismatch {
                order_id,
                declared,
                requested,
            } => AppErrorKind::Domain(DomainError::PaymentMethodMismatch {
                order_id: order_id.clone(),
                declared: declared.to_string(),
                requested: requested.to_string(),
            }),
            PaymentError::OrderNotPayable { order_id, status } => {
                AppErrorKind::Domain(DomainError::OrderNotPayable {
                    order_id: order_id.clone(),
                    status: status.to_string(),
                })
            }
            PaymentError::PaymentNotFound { reference }
            | PaymentError::UnknownTransactionReference { reference } => {
                AppErrorKind::Domain(DomainError::PaymentNotFound {
                    reference: reference.clone(),
                })
            }
            PaymentError::SignatureMismatch { reference }
            | PaymentError::AmountMismatch { reference, .. } => {
                AppErrorKind::Domain(DomainError::SignatureMismatch {
                    reference: reference.clone(),
                })
            }
            PaymentError::GatewayReportedFailure {
                reference,
                response_code,
            } => AppErrorKind::Domain(DomainError::GatewayReportedFailure {
                reference: reference.clone(),
                response_code: response_code.clone(),
            }),
            PaymentError::Storage { message, retryable } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: message.clone(),
                    is_retryable: *retryable,
                })
            }
            PaymentError::SettlementFailed { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: message.clone(),
                    is_retryable: true,
                })
            }
        };

        AppError::new(kind)
    }
}
