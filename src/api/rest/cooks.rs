use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, ErrorResponse};
use crate::models::cook::Cook;
use crate::models::driver::{GeoPoint, RatingSummary};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/cooks", post(create_cook).get(list_cooks))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCookRequest {
    pub name: String,
    pub kitchen_name: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

#[utoipa::path(
    post,
    path = "/api/cooks",
    tag = "Cooks",
    request_body = CreateCookRequest,
    responses(
        (status = 201, description = "Cook registered", body = Cook),
        (status = 400, description = "Invalid cook", body = ErrorResponse),
    )
)]
pub async fn create_cook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCookRequest>,
) -> Result<(StatusCode, Json<Cook>), AppError> {
    let now = Utc::now();
    let cook = Cook {
        id: Uuid::new_v4(),
        name: payload.name.trim().to_string(),
        kitchen_name: payload.kitchen_name.trim().to_string(),
        available: true,
        location: payload.location,
        rating: RatingSummary::default(),
        created_at: now,
        updated_at: now,
    };

    state.store.create(&cook)?;
    Ok((StatusCode::CREATED, Json(cook)))
}

#[utoipa::path(
    get,
    path = "/api/cooks",
    tag = "Cooks",
    responses((status = 200, description = "Registered cooks", body = [Cook]))
)]
pub async fn list_cooks(State(state): State<Arc<AppState>>) -> Json<Vec<Cook>> {
    Json(state.store.query::<Cook>().fetch())
}
