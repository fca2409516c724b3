//! OpenAPI document for the REST surface.

use std::sync::OnceLock;

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Food delivery API",
        description = "Orders, drivers, live delivery tracking and customer notifications."
    ),
    paths(
        crate::api::rest::health,
        crate::api::rest::system_status,
        crate::api::rest::openapi,
        crate::api::rest::orders::create_order,
        crate::api::rest::orders::list_orders,
        crate::api::rest::orders::get_order,
        crate::api::rest::orders::get_progress,
        crate::api::rest::orders::update_status,
        crate::api::rest::payments::create_payment,
        crate::api::rest::payments::get_payment,
        crate::api::rest::payments::payment_webhook,
        crate::api::rest::drivers::create_driver,
        crate::api::rest::drivers::list_drivers,
        crate::api::rest::drivers::update_availability,
        crate::api::rest::drivers::report_location,
        crate::api::rest::drivers::update_sharing,
        crate::api::rest::drivers::accept,
        crate::api::rest::drivers::get_route,
        crate::api::rest::cooks::create_cook,
        crate::api::rest::cooks::list_cooks,
        crate::api::rest::tracking::get_tracking,
        crate::api::rest::tracking::update_step,
        crate::api::rest::notifications::send_email,
        crate::api::rest::notifications::preview,
        crate::api::rest::notifications::set_permission,
    ),
    components(
        schemas(
            crate::error::ErrorResponse,
            crate::error::FieldError,
            crate::api::rest::HealthResponse,
            crate::observability::monitor::SystemStatus,
            crate::observability::monitor::HealthLevel,
            crate::engine::orders::NewOrder,
            crate::engine::lifecycle::OrderProgress,
            crate::engine::lifecycle::ProgressStep,
            crate::engine::lifecycle::StepState,
            crate::engine::location::PositionReport,
            crate::engine::location::GeolocationErrorCode,
            crate::models::order::Order,
            crate::models::order::OrderStatus,
            crate::models::order::LineItem,
            crate::models::order::OrderTotals,
            crate::models::order::DeliveryAddress,
            crate::models::order::PaymentRef,
            crate::models::driver::Driver,
            crate::models::driver::GeoPoint,
            crate::models::driver::TrackedLocation,
            crate::models::driver::Vehicle,
            crate::models::driver::VehicleKind,
            crate::models::driver::RatingSummary,
            crate::models::cook::Cook,
            crate::models::tracking::DeliveryTracking,
            crate::models::tracking::DeliveryStep,
            crate::models::route::OptimizedRoute,
            crate::models::route::RouteStop,
            crate::models::route::RoutePoint,
            crate::models::route::UnresolvedStop,
            crate::models::route::PriorityTier,
            crate::payments::PaymentInfo,
            crate::api::rest::orders::UpdateStatusRequest,
            crate::api::rest::payments::WebhookEvent,
            crate::api::rest::payments::WebhookData,
            crate::api::rest::payments::WebhookAck,
            crate::api::rest::drivers::CreateDriverRequest,
            crate::api::rest::drivers::AvailabilityRequest,
            crate::api::rest::drivers::SharingRequest,
            crate::api::rest::drivers::LocationAccepted,
            crate::api::rest::cooks::CreateCookRequest,
            crate::api::rest::tracking::StepRequest,
            crate::api::rest::notifications::EmailRequest,
            crate::api::rest::notifications::EmailSent,
            crate::api::rest::notifications::PreviewRequest,
            crate::api::rest::notifications::PermissionUpdate,
            crate::notify::NotificationContent,
            crate::notify::NotificationContext,
            crate::notify::NotificationAction,
            crate::notify::NotificationPermission,
        )
    ),
    tags(
        (name = "System", description = "Health, status and documentation"),
        (name = "Orders", description = "Order placement and lifecycle"),
        (name = "Payments", description = "Checkout and payment callbacks"),
        (name = "Drivers", description = "Drivers, positions and routes"),
        (name = "Cooks", description = "Kitchens"),
        (name = "Tracking", description = "Live delivery tracking"),
        (name = "Notifications", description = "Customer notifications and email"),
    ),
    modifiers(&SecurityAddon),
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearerAuth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

static OPENAPI_JSON_CACHE: OnceLock<String> = OnceLock::new();

pub fn openapi_json() -> Result<String, serde_json::Error> {
    if let Some(spec) = OPENAPI_JSON_CACHE.get() {
        return Ok(spec.clone());
    }

    let spec = serde_json::to_string_pretty(&openapi())?;
    let _ = OPENAPI_JSON_CACHE.set(spec.clone());
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn document_lists_order_routes() {
        let spec: Value = serde_json::from_str(&openapi_json().unwrap()).unwrap();
        let paths = spec["paths"].as_object().unwrap();

        assert!(paths.contains_key("/api/orders"));
        assert!(paths.contains_key("/api/orders/{id}/status"));
        assert!(paths.contains_key("/api/drivers/{id}/route"));
        assert!(spec["components"]["securitySchemes"]["bearerAuth"].is_object());
    }

    #[test]
    fn document_carries_package_version() {
        let doc = openapi();
        assert_eq!(doc.info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(doc.info.title, "Food delivery API");
    }
}
