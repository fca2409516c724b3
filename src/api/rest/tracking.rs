use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::engine::delivery::advance_step;
use crate::error::{AppError, ErrorResponse};
use crate::models::tracking::{DeliveryStep, DeliveryTracking};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tracking/:order_id", get(get_tracking))
        .route("/api/tracking/:order_id/step", patch(update_step))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StepRequest {
    pub step: DeliveryStep,
}

#[utoipa::path(
    get,
    path = "/api/tracking/{order_id}",
    tag = "Tracking",
    params(("order_id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Live delivery tracking", body = DeliveryTracking),
        (status = 404, description = "Order has no driver yet", body = ErrorResponse),
    )
)]
pub async fn get_tracking(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<DeliveryTracking>, AppError> {
    Ok(Json(
        state
            .store
            .fetch::<DeliveryTracking>(&order_id.to_string())?,
    ))
}

#[utoipa::path(
    patch,
    path = "/api/tracking/{order_id}/step",
    tag = "Tracking",
    params(("order_id" = Uuid, Path, description = "Order id")),
    request_body = StepRequest,
    responses(
        (status = 200, description = "Step advanced", body = DeliveryTracking),
        (status = 404, description = "No tracking for the order", body = ErrorResponse),
        (status = 409, description = "Step would move backwards", body = ErrorResponse),
    )
)]
pub async fn update_step(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<StepRequest>,
) -> Result<Json<DeliveryTracking>, AppError> {
    Ok(Json(advance_step(&state, order_id, payload.step)?))
}
