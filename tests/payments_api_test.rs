//! Integration tests for the payment HTTP endpoints (in-memory stores)

use axum::{body::Body, Router};
use bigdecimal::BigDecimal;
use chrono::FixedOffset;
use http::{Request, StatusCode};
use settlement_backend::api::{self, payments::PaymentsState};
use settlement_backend::config::GatewayConfig;
use settlement_backend::database::in_memory::InMemoryPaymentRecordStore;
use settlement_backend::health::HealthChecker;
use settlement_backend::payments::{
    canonicalize, InMemoryOrderDirectory, OrderStatus, OrderSummary, PaymentMethod, Signer,
};
use std::sync::Arc;
use tower::util::ServiceExt;
use url::{form_urlencoded, Url};

const SECRET: &str = "api-test-secret";

fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        tmn_code: "DEMOSHOP".to_string(),
        hash_secret: SECRET.to_string(),
        pay_url: "https://sandbox.gateway.test/paymentv2/vpcpay.html".to_string(),
        return_url: "https://shop.test/api/payments/gateway/return".to_string(),
        version: "2.1.0".to_string(),
        command: "pay".to_string(),
        locale: "vn".to_string(),
        currency: "VND".to_string(),
        order_type: "other".to_string(),
        clock_offset: FixedOffset::east_opt(7 * 3600).unwrap(),
        expire_minutes: 15,
        success_redirect_url: "https://shop.test/payment/success".to_string(),
        failure_redirect_url: "https://shop.test/payment/failure".to_string(),
    }
}

async fn build_app() -> (Router, Arc<InMemoryOrderDirectory>) {
    let orders = Arc::new(InMemoryOrderDirectory::new());
    for (id, method) in [
        ("O1", PaymentMethod::Gateway),
        ("O2", PaymentMethod::Gateway),
        ("O3", PaymentMethod::Gateway),
        ("C1", PaymentMethod::Cod),
    ] {
        orders
            .upsert(OrderSummary {
                order_id: id.to_string(),
                total: BigDecimal::from(150000),
                payment_method: method,
                status: OrderStatus::Pending,
            })
            .await;
    }
    let records = Arc::new(InMemoryPaymentRecordStore::new());
    let state = PaymentsState::new(Arc::new(gateway_config()), records, orders.clone()).unwrap();
    (api::router(state, HealthChecker::new(None)), orders)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn post_checkout(app: &Router, order_id: &str) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/payments/gateway")
                .header("content-type", "application/json")
                .header("x-forwarded-for", "203.0.113.7")
                .body(Body::from(
                    serde_json::json!({ "order_id": order_id }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn create_payment(app: &Router, order_id: &str) -> (String, String) {
    let response = post_checkout(app, order_id).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    (
        json["payment_url"].as_str().unwrap().to_string(),
        json["transaction_reference"].as_str().unwrap().to_string(),
    )
}

/// Signed callback query as the gateway would send it
fn callback_query(reference: &str, amount: &str, response_code: &str) -> String {
    let fields = [
        ("vnp_Amount", amount),
        ("vnp_BankCode", "NCB"),
        ("vnp_OrderInfo", "Payment for order O1"),
        ("vnp_PayDate", "20261016103015"),
        ("vnp_ResponseCode", response_code),
        ("vnp_TmnCode", "DEMOSHOP"),
        ("vnp_TransactionNo", "14123456"),
        ("vnp_TransactionStatus", response_code),
        ("vnp_TxnRef", reference),
    ];
    let canonical = canonicalize(fields.iter().map(|(k, v)| (*k, Some(*v))));
    let signature = Signer::new(SECRET).unwrap().sign(&canonical);

    let mut query = form_urlencoded::Serializer::new(String::new());
    for (k, v) in fields {
        query.append_pair(k, v);
    }
    query.append_pair("vnp_SecureHashType", "SHA512");
    query.append_pair("vnp_SecureHash", &signature);
    query.finish()
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

fn location(response: &axum::response::Response) -> Url {
    Url::parse(response.headers()["location"].to_str().unwrap()).unwrap()
}

#[tokio::test]
async fn test_create_gateway_payment_returns_signed_url() {
    let (app, _) = build_app().await;
    let (payment_url, reference) = create_payment(&app, "O1").await;

    let url = Url::parse(&payment_url).unwrap();
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let value = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap()
    };

    assert_eq!(value("vnp_TxnRef"), reference);
    assert_eq!(value("vnp_IpAddr"), "203.0.113.7");
    assert_eq!(value("vnp_Amount"), "15000000");
    assert_eq!(pairs.last().unwrap().0, "vnp_SecureHash");

    let response = get(&app, &format!("/api/payments/{}", reference)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "pending");
    assert_eq!(json["method"], "gateway");
}

#[tokio::test]
async fn test_create_gateway_payment_for_unknown_order_is_404() {
    let (app, _) = build_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/payments/gateway")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"order_id":"missing"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"], "ORDER_NOT_FOUND");
}

#[tokio::test]
async fn test_create_gateway_payment_rejects_unpayable_amounts() {
    let (app, _) = build_app().await;
    for amount in ["0", "12.345", "0.001"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/payments/gateway")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "order_id": "O1", "amount": amount }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{}", amount);
        let json = json_body(response).await;
        assert_eq!(json["error"], "INVALID_AMOUNT");
    }

    let listed = json_body(get(&app, "/api/orders/O1/payments").await).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_validation_error() {
    let (app, _) = build_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/payments/gateway")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_return_success_redirects_and_marks_order_paid() {
    let (app, orders) = build_app().await;
    let (_, reference) = create_payment(&app, "O1").await;

    let uri = format!(
        "/api/payments/gateway/return?{}",
        callback_query(&reference, "15000000", "00")
    );
    let response = get(&app, &uri).await;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response);
    assert_eq!(target.path(), "/payment/success");
    assert_eq!(orders.status_of("O1").await, Some(OrderStatus::Paid));
}

#[tokio::test]
async fn test_return_with_bad_signature_redirects_to_failure_with_reason() {
    let (app, orders) = build_app().await;
    let (_, reference) = create_payment(&app, "O1").await;

    let query = callback_query(&reference, "15000000", "00").replace(
        "vnp_Amount=15000000",
        "vnp_Amount=15000001",
    );
    let response = get(&app, &format!("/api/payments/gateway/return?{}", query)).await;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response);
    assert_eq!(target.path(), "/payment/failure");
    assert!(target
        .query_pairs()
        .any(|(k, v)| k == "reason" && v == "signature_mismatch"));
    assert_eq!(orders.status_of("O1").await, Some(OrderStatus::Pending));

    let json = json_body(get(&app, &format!("/api/payments/{}", reference)).await).await;
    assert_eq!(json["status"], "failed");
}

#[tokio::test]
async fn test_return_with_cancelled_payment_carries_gateway_failure_reason() {
    let (app, _) = build_app().await;
    let (_, reference) = create_payment(&app, "O1").await;

    let uri = format!(
        "/api/payments/gateway/return?{}",
        callback_query(&reference, "15000000", "24")
    );
    let response = get(&app, &uri).await;

    let target = location(&response);
    assert_eq!(target.path(), "/payment/failure");
    assert!(target
        .query_pairs()
        .any(|(k, v)| k == "reason" && v == "gateway_failure"));
}

#[tokio::test]
async fn test_ipn_acknowledgement_codes() {
    let (app, orders) = build_app().await;
    let (_, reference) = create_payment(&app, "O1").await;

    let ack = |uri: String| {
        let app = app.clone();
        async move { json_body(get(&app, &uri).await).await["RspCode"].clone() }
    };

    let success = callback_query(&reference, "15000000", "00");
    assert_eq!(ack(format!("/api/payments/gateway/ipn?{}", success)).await, "00");
    // Same notification again, e.g. after the browser return already settled it
    assert_eq!(ack(format!("/api/payments/gateway/ipn?{}", success)).await, "02");
    assert_eq!(orders.status_requests().await.len(), 1);

    let unknown = callback_query("20261016000000DEADBEEF", "15000000", "00");
    assert_eq!(ack(format!("/api/payments/gateway/ipn?{}", unknown)).await, "01");

    // A paid order takes no further attempts
    let again = post_checkout(&app, "O1").await;
    assert_eq!(again.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(again).await["error"], "ORDER_NOT_PAYABLE");

    let (_, second) = create_payment(&app, "O2").await;
    let wrong_amount = callback_query(&second, "100", "00");
    assert_eq!(ack(format!("/api/payments/gateway/ipn?{}", wrong_amount)).await, "04");

    let (_, third) = create_payment(&app, "O3").await;
    let forged = callback_query(&third, "15000000", "00").replace("vnp_BankCode=NCB", "vnp_BankCode=VCB");
    assert_eq!(ack(format!("/api/payments/gateway/ipn?{}", forged)).await, "97");
}

#[tokio::test]
async fn test_cod_confirmation() {
    let (app, _) = build_app().await;

    let post = |uri: &'static str| {
        let app = app.clone();
        async move {
            app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
        }
    };

    let created = post("/api/orders/C1/cod").await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let json = json_body(created).await;
    assert_eq!(json["payment"]["status"], "unpaid");
    assert_eq!(json["payment"]["method"], "cod");
    let payment_id = json["payment"]["id"].as_str().unwrap().to_string();

    let repeated = post("/api/orders/C1/cod").await;
    assert_eq!(repeated.status(), StatusCode::OK);

    let mismatch = post("/api/orders/O1/cod").await;
    assert_eq!(mismatch.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(mismatch).await["error"], "PAYMENT_METHOD_MISMATCH");

    let by_id = get(&app, &format!("/api/payments/{}", payment_id)).await;
    assert_eq!(by_id.status(), StatusCode::OK);

    let listed = json_body(get(&app, "/api/orders/O1/payments").await).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_payment_lookup_is_404() {
    let (app, _) = build_app().await;
    let response = get(&app, "/api/payments/NOPE").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "PAYMENT_NOT_FOUND");
}

#[tokio::test]
async fn test_health_and_request_id() {
    let (app, _) = build_app().await;
    let response = get(&app, "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json = json_body(response).await;
    assert_eq!(json["status"], "degraded");
}
