pub mod cooks;
pub mod drivers;
pub mod middleware;
pub mod notifications;
pub mod orders;
pub mod payments;
pub mod tracking;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use utoipa::ToSchema;

use crate::api::openapi::openapi_json;
use crate::auth::AdminClaims;
use crate::error::{AppError, ErrorResponse};
use crate::observability::monitor::{HealthLevel, SystemStatus};
use crate::state::AppState;
use crate::store::Collection;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(orders::router())
        .merge(payments::router())
        .merge(drivers::router())
        .merge(cooks::router())
        .merge(tracking::router())
        .merge(notifications::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/system/status", get(system_status))
        .route("/api/docs/openapi.json", get(openapi))
        .route("/ws/orders/:id", get(ws::ws_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::track_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .fallback_service(ServeDir::new("static"))
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    orders: usize,
    drivers: usize,
    cooks: usize,
    active_deliveries: usize,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    responses((status = 200, description = "Liveness and document counts", body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        orders: state.store.len(Collection::Orders),
        drivers: state.store.len(Collection::Drivers),
        cooks: state.store.len(Collection::Cooks),
        active_deliveries: state.store.len(Collection::DeliveryTracking),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}

/// Request health for operators; 503 while the service is unhealthy.
#[utoipa::path(
    get,
    path = "/api/system/status",
    tag = "System",
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Healthy or degraded", body = SystemStatus),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Token lacks the admin claim", body = ErrorResponse),
        (status = 503, description = "Unhealthy", body = SystemStatus),
    )
)]
pub async fn system_status(
    State(state): State<Arc<AppState>>,
    AdminClaims(_claims): AdminClaims,
) -> Response {
    let status = state.monitor.snapshot(Utc::now());
    let code = if status.status == HealthLevel::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (code, Json(status)).into_response()
}

#[utoipa::path(
    get,
    path = "/api/docs/openapi.json",
    tag = "System",
    responses(
        (status = 200, description = "OpenAPI document", body = String, content_type = "application/json"),
        (status = 500, description = "Internal error", body = ErrorResponse),
    )
)]
pub async fn openapi() -> Response {
    match openapi_json() {
        Ok(spec) => (StatusCode::OK, [(CONTENT_TYPE, "application/json")], spec).into_response(),
        Err(err) => {
            AppError::Internal(format!("failed to serialize OpenAPI document: {err}")).into_response()
        }
    }
}
