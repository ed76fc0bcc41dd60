//! Application error type shared by the HTTP surface
//!
//! Subsystem errors (`PaymentError`, `DatabaseError`) convert into `AppError`,
//! which carries the HTTP status, a stable error code for clients, and a
//! message safe to show to a shopper.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "ORDER_NOT_FOUND")]
    OrderNotFound,
    #[serde(rename = "INVALID_AMOUNT")]
    InvalidAmount,
    #[serde(rename = "PAYMENT_METHOD_MISMATCH")]
    PaymentMethodMismatch,
    #[serde(rename = "ORDER_NOT_PAYABLE")]
    OrderNotPayable,
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "SIGNATURE_MISMATCH")]
    SignatureMismatch,
    #[serde(rename = "GATEWAY_REPORTED_FAILURE")]
    GatewayReportedFailure,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Settlement business-rule errors
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Amount is zero, negative or unparseable
    InvalidAmount { amount: String },
    OrderNotFound { order_id: String },
    /// Order declares a different payment method than the one requested
    PaymentMethodMismatch {
        order_id: String,
        declared: String,
        requested: String,
    },
    /// Order is no longer awaiting payment
    OrderNotPayable { order_id: String, status: String },
    PaymentNotFound { reference: String },
    SignatureMismatch { reference: String },
    GatewayReportedFailure {
        reference: String,
        response_code: String,
    },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidField { field: String, reason: String },
    MissingField { field: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidAmount { .. } => 422,
                DomainError::OrderNotFound { .. } => 404,
                DomainError::PaymentMethodMismatch { .. } => 409,
                DomainError::OrderNotPayable { .. } => 409,
                DomainError::PaymentNotFound { .. } => 404,
                DomainError::SignatureMismatch { .. } => 400,
                DomainError::GatewayReportedFailure { .. } => 402,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => {
                    if *is_retryable {
                        503
                    } else {
                        500
                    }
                }
                InfrastructureError::Configuration { .. } => 500,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::PaymentMethodMismatch { .. } => ErrorCode::PaymentMethodMismatch,
                DomainError::OrderNotPayable { .. } => ErrorCode::OrderNotPayable,
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::SignatureMismatch { .. } => ErrorCode::SignatureMismatch,
                DomainError::GatewayReportedFailure { .. } => ErrorCode::GatewayReportedFailure,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidAmount { amount } => {
                    format!(
                        "Invalid amount '{}': must be greater than zero with at most two decimal places",
                        amount
                    )
                }
                DomainError::OrderNotFound { order_id } => {
                    format!("Order '{}' not found", order_id)
                }
                DomainError::PaymentMethodMismatch {
                    order_id,
                    declared,
                    requested,
                } => format!(
                    "Order '{}' is paid by {}, not {}",
                    order_id, declared, requested
                ),
                DomainError::OrderNotPayable { order_id, status } => {
                    format!("Order '{}' is {} and cannot be paid", order_id, status)
                }
                DomainError::PaymentNotFound { reference } => {
                    format!("Payment '{}' not found", reference)
                }
                DomainError::SignatureMismatch { .. } => {
                    "Payment confirmation could not be verified".to_string()
                }
                DomainError::GatewayReportedFailure { response_code, .. } => {
                    format!("Payment was declined by the gateway (code {})", response_code)
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError> lives in database/error.rs, From<PaymentError> in payments/error.rs

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_not_found_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::OrderNotFound {
            order_id: "ORD-1".to_string(),
        }));

        assert_eq!(error.status_code(), 404);
        assert_eq!(error.error_code(), ErrorCode::OrderNotFound);
        assert!(error.user_message().contains("ORD-1"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_payment_method_mismatch_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::PaymentMethodMismatch {
            order_id: "ORD-1".to_string(),
            declared: "gateway".to_string(),
            requested: "cod".to_string(),
        }));

        assert_eq!(error.status_code(), 409);
        assert_eq!(error.error_code(), ErrorCode::PaymentMethodMismatch);
    }

    #[test]
    fn test_retryable_database_error() {
        let error = AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: "pool timed out".to_string(),
            is_retryable: true,
        }));

        assert_eq!(error.status_code(), 503);
        assert!(error.is_retryable());
        assert!(!error.user_message().contains("pool"));
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::new(AppErrorKind::Validation(ValidationError::MissingField {
            field: "order_id".to_string(),
        }));

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert!(!error.is_retryable());
    }
}
