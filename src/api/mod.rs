pub mod payments;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::health::{HealthChecker, HealthState, HealthStatus};
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use self::payments::PaymentsState;

/// GET /health
async fn health(State(checker): State<HealthChecker>) -> (StatusCode, Json<HealthStatus>) {
    let status = checker.check_health().await;
    let code = match status.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
    };
    (code, Json(status))
}

/// Full application router with request-id and logging layers
pub fn router(payments: PaymentsState, health_checker: HealthChecker) -> Router {
    let payment_routes = Router::new()
        .route(
            "/api/payments/gateway",
            post(payments::create_gateway_payment),
        )
        .route(
            "/api/payments/gateway/return",
            get(payments::gateway_return),
        )
        .route("/api/payments/gateway/ipn", get(payments::gateway_ipn))
        .route("/api/payments/{reference}", get(payments::get_payment))
        .route("/api/orders/{order_id}/cod", post(payments::confirm_cod))
        .route(
            "/api/orders/{order_id}/payments",
            get(payments::list_order_payments),
        )
        .with_state(payments);

    let health_routes = Router::new()
        .route("/health", get(health))
        .with_state(health_checker);

    Router::new()
        .merge(payment_routes)
        .merge(health_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
