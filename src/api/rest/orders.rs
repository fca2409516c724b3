use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::api::rest::payments::create_payment;
use crate::engine::lifecycle::{progress, OrderProgress};
use crate::engine::orders::{create_order as place_order, transition, NewOrder};
use crate::error::{AppError, ErrorResponse};
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/orders", post(create_order).get(list_orders))
        .route("/api/orders/:id", get(get_order))
        .route("/api/orders/:id/progress", get(get_progress))
        .route("/api/orders/:id/status", patch(update_status))
        .route("/api/orders/:id/payment", post(create_payment))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub customer_id: Option<Uuid>,
    pub cook_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

#[utoipa::path(
    post,
    path = "/api/orders",
    tag = "Orders",
    request_body = NewOrder,
    responses(
        (status = 201, description = "Order placed", body = Order),
        (status = 400, description = "Invalid order", body = ErrorResponse),
        (status = 404, description = "Unknown cook", body = ErrorResponse),
        (status = 409, description = "Cook is not taking orders", body = ErrorResponse),
    )
)]
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewOrder>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let order = place_order(&state, payload)?;
    Ok((StatusCode::CREATED, Json(order)))
}

#[utoipa::path(
    get,
    path = "/api/orders",
    tag = "Orders",
    params(OrderFilter),
    responses((status = 200, description = "Matching orders, newest first", body = [Order]))
)]
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<OrderFilter>,
) -> Json<Vec<Order>> {
    let mut query = state.store.query::<Order>();
    if let Some(status) = filter.status {
        query = query.filter(move |order| order.status == status);
    }
    if let Some(customer_id) = filter.customer_id {
        query = query.filter(move |order| order.customer_id == customer_id);
    }
    if let Some(cook_id) = filter.cook_id {
        query = query.filter(move |order| order.cook_id == cook_id);
    }
    if let Some(driver_id) = filter.driver_id {
        query = query.filter(move |order| order.driver_id == Some(driver_id));
    }

    let mut orders = query.fetch();
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = filter.limit {
        orders.truncate(limit);
    }

    Json(orders)
}

#[utoipa::path(
    get,
    path = "/api/orders/{id}",
    tag = "Orders",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "The order", body = Order),
        (status = 404, description = "No such order", body = ErrorResponse),
    )
)]
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.store.fetch::<Order>(&id.to_string())?))
}

#[utoipa::path(
    get,
    path = "/api/orders/{id}/progress",
    tag = "Orders",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Customer-facing progress", body = OrderProgress),
        (status = 404, description = "No such order", body = ErrorResponse),
    )
)]
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderProgress>, AppError> {
    let order = state.store.fetch::<Order>(&id.to_string())?;
    Ok(Json(progress(order.status, order.created_at, Utc::now())))
}

#[utoipa::path(
    patch,
    path = "/api/orders/{id}/status",
    tag = "Orders",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status changed", body = Order),
        (status = 404, description = "No such order", body = ErrorResponse),
        (status = 409, description = "Transition not allowed", body = ErrorResponse),
    )
)]
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(transition(&state, id, payload.status)?))
}
