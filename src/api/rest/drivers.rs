use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::engine::delivery::{accept_order, plan_route};
use crate::engine::location::{PositionReport, PositionSample};
use crate::engine::queue::enqueue_position;
use crate::error::{AppError, ErrorResponse};
use crate::models::driver::{Driver, GeoPoint, RatingSummary, Vehicle};
use crate::models::route::OptimizedRoute;
use crate::models::tracking::DeliveryTracking;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/drivers", post(create_driver).get(list_drivers))
        .route("/api/drivers/:id/availability", patch(update_availability))
        .route("/api/drivers/:id/location", post(report_location))
        .route("/api/drivers/:id/sharing", patch(update_sharing))
        .route("/api/drivers/:id/accept/:order_id", post(accept))
        .route("/api/drivers/:id/route", get(get_route))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateDriverRequest {
    pub name: String,
    pub phone: String,
    pub vehicle: Vehicle,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DriverFilter {
    pub online: Option<bool>,
    pub available: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AvailabilityRequest {
    pub online: Option<bool>,
    pub available: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SharingRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LocationAccepted {
    pub queued: bool,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RouteQuery {
    /// Start latitude; defaults to the driver's last reported position.
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[utoipa::path(
    post,
    path = "/api/drivers",
    tag = "Drivers",
    request_body = CreateDriverRequest,
    responses(
        (status = 201, description = "Driver registered", body = Driver),
        (status = 400, description = "Invalid driver", body = ErrorResponse),
    )
)]
pub async fn create_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDriverRequest>,
) -> Result<(StatusCode, Json<Driver>), AppError> {
    let now = Utc::now();
    let driver = Driver {
        id: Uuid::new_v4(),
        name: payload.name.trim().to_string(),
        phone: payload.phone.trim().to_string(),
        online: false,
        available: true,
        sharing_location: false,
        current_location: None,
        vehicle: payload.vehicle,
        rating: RatingSummary::default(),
        active_order_id: None,
        created_at: now,
        updated_at: now,
    };

    state.store.create(&driver)?;
    Ok((StatusCode::CREATED, Json(driver)))
}

#[utoipa::path(
    get,
    path = "/api/drivers",
    tag = "Drivers",
    params(DriverFilter),
    responses((status = 200, description = "Registered drivers", body = [Driver]))
)]
pub async fn list_drivers(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<DriverFilter>,
) -> Json<Vec<Driver>> {
    let DriverFilter { online, available } = filter;
    let drivers = state
        .store
        .query::<Driver>()
        .filter(move |driver| online.map_or(true, |online| driver.online == online))
        .filter(move |driver| available.map_or(true, |available| driver.available == available))
        .fetch();

    Json(drivers)
}

#[utoipa::path(
    patch,
    path = "/api/drivers/{id}/availability",
    tag = "Drivers",
    params(("id" = Uuid, Path, description = "Driver id")),
    request_body = AvailabilityRequest,
    responses(
        (status = 200, description = "Updated driver", body = Driver),
        (status = 404, description = "No such driver", body = ErrorResponse),
        (status = 409, description = "Driver is on a delivery", body = ErrorResponse),
    )
)]
pub async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AvailabilityRequest>,
) -> Result<Json<Driver>, AppError> {
    let driver = state.store.update::<Driver, _>(&id.to_string(), |driver| {
        if let Some(online) = payload.online {
            driver.online = online;
        }
        if let Some(available) = payload.available {
            if available && driver.has_active_delivery() {
                return Err(AppError::Conflict(format!(
                    "driver {} is on a delivery",
                    driver.id
                )));
            }
            driver.available = available;
        }
        driver.updated_at = Utc::now();
        Ok(())
    })?;

    Ok(Json(driver))
}

/// Queues a device position for the location publisher.
#[utoipa::path(
    post,
    path = "/api/drivers/{id}/location",
    tag = "Drivers",
    params(("id" = Uuid, Path, description = "Driver id")),
    request_body = PositionReport,
    responses(
        (status = 202, description = "Sample queued", body = LocationAccepted),
        (status = 404, description = "No such driver", body = ErrorResponse),
    )
)]
pub async fn report_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(report): Json<PositionReport>,
) -> Result<(StatusCode, Json<LocationAccepted>), AppError> {
    state.store.fetch::<Driver>(&id.to_string())?;

    enqueue_position(
        &state,
        PositionSample {
            driver_id: id,
            report,
            received_at: Utc::now(),
        },
    )
    .await?;

    Ok((StatusCode::ACCEPTED, Json(LocationAccepted { queued: true })))
}

#[utoipa::path(
    patch,
    path = "/api/drivers/{id}/sharing",
    tag = "Drivers",
    params(("id" = Uuid, Path, description = "Driver id")),
    request_body = SharingRequest,
    responses(
        (status = 200, description = "Updated driver", body = Driver),
        (status = 404, description = "No such driver", body = ErrorResponse),
    )
)]
pub async fn update_sharing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SharingRequest>,
) -> Result<Json<Driver>, AppError> {
    let driver = state.store.update::<Driver, _>(&id.to_string(), |driver| {
        driver.sharing_location = payload.enabled;
        driver.updated_at = Utc::now();
        Ok(())
    })?;

    state.throttle.forget(id);
    Ok(Json(driver))
}

#[utoipa::path(
    post,
    path = "/api/drivers/{id}/accept/{order_id}",
    tag = "Drivers",
    params(
        ("id" = Uuid, Path, description = "Driver id"),
        ("order_id" = Uuid, Path, description = "Order id"),
    ),
    responses(
        (status = 201, description = "Order assigned; tracking opened", body = DeliveryTracking),
        (status = 404, description = "No such driver or order", body = ErrorResponse),
        (status = 409, description = "Driver busy or order not assignable", body = ErrorResponse),
    )
)]
pub async fn accept(
    State(state): State<Arc<AppState>>,
    Path((id, order_id)): Path<(Uuid, Uuid)>,
) -> Result<(StatusCode, Json<DeliveryTracking>), AppError> {
    let tracking = accept_order(&state, id, order_id).await?;
    Ok((StatusCode::CREATED, Json(tracking)))
}

#[utoipa::path(
    get,
    path = "/api/drivers/{id}/route",
    tag = "Drivers",
    params(("id" = Uuid, Path, description = "Driver id"), RouteQuery),
    responses(
        (status = 200, description = "Sequenced stops", body = OptimizedRoute),
        (status = 400, description = "No start position", body = ErrorResponse),
        (status = 404, description = "No such driver", body = ErrorResponse),
    )
)]
pub async fn get_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<RouteQuery>,
) -> Result<Json<OptimizedRoute>, AppError> {
    let start = match (query.lat, query.lng) {
        (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
        (None, None) => None,
        _ => {
            return Err(AppError::BadRequest(
                "lat and lng must be given together".to_string(),
            ))
        }
    };

    Ok(Json(plan_route(&state, id, start).await?))
}
