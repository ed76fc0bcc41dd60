//! Payment endpoints: gateway checkout, gateway callbacks, COD confirmation
//! and record lookup.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, State},
    http::{Extensions, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::database::payment_record_repository::PaymentRecordStore;
use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::middleware::error::{get_request_id_from_headers, ErrorResponse};
use crate::payments::{
    CallbackParams, CallbackVerifier, GatewayUrlBuilder, OrderCollaborator, PaymentError,
    PaymentRecord, PaymentResult, PaymentStatus, PaymentUrlRequest, SettlementCoordinator,
    SettlementOutcome,
};

#[derive(Clone)]
pub struct PaymentsState {
    pub builder: Arc<GatewayUrlBuilder>,
    pub verifier: Arc<CallbackVerifier>,
    pub coordinator: Arc<SettlementCoordinator>,
    pub records: Arc<dyn PaymentRecordStore>,
    pub success_redirect_url: String,
    pub failure_redirect_url: String,
}

impl PaymentsState {
    /// Wire the settlement components over the given stores
    pub fn new(
        config: Arc<GatewayConfig>,
        records: Arc<dyn PaymentRecordStore>,
        orders: Arc<dyn OrderCollaborator>,
    ) -> PaymentResult<Self> {
        let builder = GatewayUrlBuilder::new(config.clone(), orders.clone(), records.clone())?;
        let verifier =
            CallbackVerifier::new(&config.hash_secret, config.tmn_code.clone(), records.clone())?;
        let coordinator =
            SettlementCoordinator::new(records.clone(), orders, config.currency.clone());

        Ok(Self {
            builder: Arc::new(builder),
            verifier: Arc::new(verifier),
            coordinator: Arc::new(coordinator),
            records,
            success_redirect_url: config.success_redirect_url.clone(),
            failure_redirect_url: config.failure_redirect_url.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateGatewayPaymentRequest {
    pub order_id: String,
    pub amount: Option<BigDecimal>,
    pub bank_code: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGatewayPaymentResponse {
    pub payment_url: String,
    pub transaction_reference: String,
}

/// Gateway IPN acknowledgement body
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpnAck {
    #[serde(rename = "RspCode")]
    pub rsp_code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl IpnAck {
    fn new(code: &str, message: &str) -> Self {
        Self {
            rsp_code: code.to_string(),
            message: message.to_string(),
        }
    }
}

fn app_error(err: PaymentError, headers: &HeaderMap) -> AppError {
    let error = AppError::from(err);
    match get_request_id_from_headers(headers) {
        Some(request_id) => error.with_request_id(request_id),
        None => error,
    }
}

/// First `X-Forwarded-For` hop, else the socket peer
fn caller_ip(headers: &HeaderMap, extensions: &Extensions) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_default()
}

/// POST /api/payments/gateway
pub async fn create_gateway_payment(
    State(state): State<PaymentsState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<CreateGatewayPaymentRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            let response = ErrorResponse::validation_error(
                get_request_id_from_headers(&headers),
                "body",
                &rejection.body_text(),
            );
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    if body.order_id.trim().is_empty() {
        let error = AppError::new(AppErrorKind::Validation(ValidationError::MissingField {
            field: "order_id".to_string(),
        }));
        return error.into_response();
    }

    let request = PaymentUrlRequest {
        order_id: body.order_id.trim().to_string(),
        amount: body.amount,
        client_ip: caller_ip(&headers, &extensions),
        bank_code: body.bank_code,
        locale: body.locale,
    };

    match state.builder.create_payment_url(request).await {
        Ok(redirect) => Json(CreateGatewayPaymentResponse {
            payment_url: redirect.payment_url,
            transaction_reference: redirect.transaction_reference,
        })
        .into_response(),
        Err(e) => app_error(e, &headers).into_response(),
    }
}

/// GET /api/payments/gateway/return
///
/// The shopper's browser lands here. Always answers with a redirect to the
/// storefront, never with a server error.
pub async fn gateway_return(
    State(state): State<PaymentsState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Redirect {
    let params = CallbackParams::from_pairs(pairs);
    let reference = params.reference().to_string();

    let outcome = match state.verifier.verify(&params).await {
        Ok(verification) => state.coordinator.settle(verification).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(SettlementOutcome::Paid(_)) => success_redirect(&state, &reference),
        Ok(SettlementOutcome::Duplicate(record)) => match record.status {
            PaymentStatus::Failed => failure_redirect(
                &state,
                &reference,
                record.failure_reason.as_deref().unwrap_or("gateway_failure"),
            ),
            // Pending here means another attempt already paid the order
            _ => success_redirect(&state, &reference),
        },
        Ok(SettlementOutcome::Rejected { error, .. }) => {
            failure_redirect(&state, &reference, error.reason_code())
        }
        Err(e) => {
            error!(error = %e, "Gateway return could not be settled");
            failure_redirect(&state, &reference, e.reason_code())
        }
    }
}

/// GET /api/payments/gateway/ipn
pub async fn gateway_ipn(
    State(state): State<PaymentsState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Json<IpnAck> {
    let params = CallbackParams::from_pairs(pairs);

    let outcome = match state.verifier.verify(&params).await {
        Ok(verification) => state.coordinator.settle(verification).await,
        Err(e) => Err(e),
    };

    let ack = match outcome {
        Ok(SettlementOutcome::Paid(_)) => IpnAck::new("00", "Confirm Success"),
        Ok(SettlementOutcome::Duplicate(_)) => IpnAck::new("02", "Order already confirmed"),
        Ok(SettlementOutcome::Rejected { error, .. }) => match error {
            PaymentError::GatewayReportedFailure { .. } => IpnAck::new("00", "Confirm Success"),
            PaymentError::UnknownTransactionReference { .. } => {
                IpnAck::new("01", "Order not found")
            }
            PaymentError::AmountMismatch { .. } => IpnAck::new("04", "Invalid amount"),
            PaymentError::SignatureMismatch { .. } => IpnAck::new("97", "Invalid signature"),
            other => {
                warn!(error = %other, "Unexpected IPN rejection");
                IpnAck::new("99", "Unknown error")
            }
        },
        Err(e) => {
            error!(error = %e, "IPN could not be settled");
            IpnAck::new("99", "Unknown error")
        }
    };

    info!(rsp_code = %ack.rsp_code, "IPN acknowledged");
    Json(ack)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CodConfirmationResponse {
    pub created: bool,
    pub payment: PaymentRecord,
}

/// POST /api/orders/{order_id}/cod
pub async fn confirm_cod(
    State(state): State<PaymentsState>,
    Path(order_id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<CodConfirmationResponse>), AppError> {
    let confirmation = state
        .coordinator
        .confirm_cod(&order_id)
        .await
        .map_err(|e| app_error(e, &headers))?;

    let status = if confirmation.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CodConfirmationResponse {
            created: confirmation.created,
            payment: confirmation.record,
        }),
    ))
}

/// GET /api/payments/{reference}
///
/// Accepts a transaction reference or a payment id.
pub async fn get_payment(
    State(state): State<PaymentsState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PaymentRecord>, AppError> {
    let found = match Uuid::parse_str(&reference) {
        Ok(id) => state.records.find_by_id(id).await,
        Err(_) => state.records.find_by_reference(&reference).await,
    }
    .map_err(|e| app_error(e.into(), &headers))?;

    found
        .map(Json)
        .ok_or_else(|| app_error(PaymentError::PaymentNotFound { reference }, &headers))
}

/// GET /api/orders/{order_id}/payments
pub async fn list_order_payments(
    State(state): State<PaymentsState>,
    Path(order_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<PaymentRecord>>, AppError> {
    state
        .records
        .find_by_order(&order_id)
        .await
        .map(Json)
        .map_err(|e| app_error(e.into(), &headers))
}

fn success_redirect(state: &PaymentsState, reference: &str) -> Redirect {
    redirect_with(&state.success_redirect_url, &[("reference", reference)])
}

fn failure_redirect(state: &PaymentsState, reference: &str, reason: &str) -> Redirect {
    redirect_with(
        &state.failure_redirect_url,
        &[("reason", reason), ("reference", reference)],
    )
}

/// 303 to `base` with extra query pairs; empty values are skipped
fn redirect_with(base: &str, pairs: &[(&str, &str)]) -> Redirect {
    match Url::parse(base) {
        Ok(mut url) => {
            {
                let mut query = url.query_pairs_mut();
                for (key, value) in pairs.iter().filter(|(_, v)| !v.is_empty()) {
                    query.append_pair(key, value);
                }
            }
            Redirect::to(url.as_str())
        }
        Err(_) => Redirect::to(base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_wins_over_socket_address() {
        let mut headers = HeaderMap::new();
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 9], 4000))));
        assert_eq!(caller_ip(&headers, &extensions), "10.0.0.9");

        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(caller_ip(&headers, &extensions), "203.0.113.7");
    }

    #[test]
    fn redirect_carries_reason_and_reference() {
        let response = redirect_with(
            "https://shop.test/payment/failure",
            &[("reason", "signature_mismatch"), ("reference", "R1")],
        )
        .into_response();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()["location"].to_str().unwrap();
        assert_eq!(
            location,
            "https://shop.test/payment/failure?reason=signature_mismatch&reference=R1"
        );
    }
}
