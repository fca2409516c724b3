use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, ErrorResponse};
use crate::models::order::{Order, OrderStatus, PaymentRef};
use crate::payments::{preference_request, PaymentGateway, PaymentInfo};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/payments/webhook", post(payment_webhook))
        .route("/api/payments/:payment_id", get(get_payment))
}

fn gateway(state: &AppState) -> Result<Arc<dyn PaymentGateway>, AppError> {
    state
        .services
        .payments
        .clone()
        .ok_or_else(|| AppError::ServiceUnavailable("payments are not configured".to_string()))
}

/// Opens a checkout for the order. A second call returns the checkout that
/// already exists instead of creating another one.
#[utoipa::path(
    post,
    path = "/api/orders/{id}/payment",
    tag = "Payments",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 201, description = "Checkout created", body = PaymentRef),
        (status = 200, description = "Checkout already existed", body = PaymentRef),
        (status = 404, description = "No such order", body = ErrorResponse),
        (status = 409, description = "Order was cancelled", body = ErrorResponse),
        (status = 500, description = "Payment provider failed", body = ErrorResponse),
        (status = 503, description = "Payments not configured", body = ErrorResponse),
    )
)]
pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<PaymentRef>), AppError> {
    let gateway = gateway(&state)?;
    let _claim = state.checkouts.claim(id).await;
    let order = state.store.fetch::<Order>(&id.to_string())?;

    if order.status == OrderStatus::Cancelled {
        return Err(AppError::Conflict(format!("order {} was cancelled", order.id)));
    }
    if let Some(existing) = order.payment.as_ref().filter(|payment| payment.has_checkout()) {
        return Ok((StatusCode::OK, Json(existing.clone())));
    }

    let request = preference_request(&order, &state.config.payments.public_base_url);
    let preference = gateway.create_preference(&request).await.map_err(|err| {
        warn!(order_id = %order.id, error = %err, "payment preference failed");
        err
    })?;

    let updated = state.store.update::<Order, _>(&id.to_string(), |order| {
        let payment = order.payment.get_or_insert_with(PaymentRef::default);
        payment.preference_id = Some(preference.id.clone());
        payment.init_point = Some(preference.init_point.clone());
        order.updated_at = Utc::now();
        Ok(())
    })?;

    info!(order_id = %id, preference_id = %preference.id, "payment checkout created");

    Ok((StatusCode::CREATED, Json(updated.payment.unwrap_or_default())))
}

#[utoipa::path(
    get,
    path = "/api/payments/{payment_id}",
    tag = "Payments",
    params(("payment_id" = String, Path, description = "Provider payment id")),
    responses(
        (status = 200, description = "Payment as reported by the provider", body = PaymentInfo),
        (status = 404, description = "Unknown payment", body = ErrorResponse),
        (status = 500, description = "Payment provider failed", body = ErrorResponse),
        (status = 503, description = "Payments not configured", body = ErrorResponse),
    )
)]
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentInfo>, AppError> {
    let gateway = gateway(&state)?;
    Ok(Json(gateway.payment_status(&payment_id).await?))
}

/// Provider callback, e.g. `{"type": "payment", "data": {"id": "123"}}`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct WebhookEvent {
    #[serde(rename = "type", alias = "topic", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Option<WebhookData>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WebhookData {
    #[schema(value_type = String)]
    pub id: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    pub order_id: Option<Uuid>,
    pub status: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/payments/webhook",
    tag = "Payments",
    request_body = WebhookEvent,
    responses(
        (status = 200, description = "Event handled or ignored", body = WebhookAck),
        (status = 400, description = "Malformed event", body = ErrorResponse),
        (status = 503, description = "Payments not configured", body = ErrorResponse),
    )
)]
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    Json(event): Json<WebhookEvent>,
) -> Result<Json<WebhookAck>, AppError> {
    let ignored = Json(WebhookAck {
        received: true,
        order_id: None,
        status: None,
    });

    if event.kind.as_deref() != Some("payment") {
        return Ok(ignored);
    }

    let payment_id = match event.data.map(|data| data.id) {
        Some(Value::String(id)) if !id.trim().is_empty() => id,
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(AppError::BadRequest("payment event without data.id".to_string())),
    };

    let gateway = gateway(&state)?;
    let payment = gateway.payment_status(&payment_id).await?;

    let Some(order_id) = payment
        .external_reference
        .as_deref()
        .and_then(|reference| reference.parse::<Uuid>().ok())
    else {
        warn!(payment_id = %payment_id, "payment without a known order reference");
        return Ok(ignored);
    };

    let order = state.store.update::<Order, _>(&order_id.to_string(), |order| {
        let payment_ref = order.payment.get_or_insert_with(PaymentRef::default);
        payment_ref.payment_id = Some(payment.id.to_string());
        payment_ref.status = Some(payment.status.clone());
        order.updated_at = Utc::now();
        Ok(())
    })?;

    info!(
        order_id = %order.id,
        payment_id = %payment_id,
        status = %payment.status,
        "payment status recorded"
    );

    Ok(Json(WebhookAck {
        received: true,
        order_id: Some(order.id),
        status: Some(payment.status),
    }))
}
