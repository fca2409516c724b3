//! Driver side of an order: accepting it, walking the delivery steps and
//! keeping the ETA strings on the tracking document current.

use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::orders::{release_driver, transition};
use crate::engine::route::{build_route_points, sequence, RouteConfig};
use crate::error::AppError;
use crate::geo::{format_eta, haversine_km, travel_minutes};
use crate::models::cook::Cook;
use crate::models::driver::{Driver, GeoPoint};
use crate::models::order::{Order, OrderStatus};
use crate::models::route::OptimizedRoute;
use crate::models::tracking::{DeliveryStep, DeliveryTracking};
use crate::state::AppState;

/// Kitchen and drop-off coordinates of one order, when known.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Waypoints {
    pub pickup: Option<GeoPoint>,
    pub dropoff: Option<GeoPoint>,
}

impl Waypoints {
    /// `(eta_pickup, eta_delivery)` for a driver at `from` on `step`.
    pub fn etas(
        &self,
        step: DeliveryStep,
        from: GeoPoint,
        config: &RouteConfig,
    ) -> (Option<String>, Option<String>) {
        let minutes = |a: &GeoPoint, b: &GeoPoint| travel_minutes(haversine_km(a, b), config.speed_kmh);

        match step {
            DeliveryStep::HeadingToPickup => {
                let to_pickup = self.pickup.map(|pickup| minutes(&from, &pickup));
                let to_dropoff = match (to_pickup, self.pickup, self.dropoff) {
                    (Some(first), Some(pickup), Some(dropoff)) => {
                        Some(first + minutes(&pickup, &dropoff))
                    }
                    _ => None,
                };
                (to_pickup.map(format_eta), to_dropoff.map(format_eta))
            }
            DeliveryStep::AtPickup | DeliveryStep::HeadingToDelivery => (
                None,
                self.dropoff
                    .map(|dropoff| format_eta(minutes(&from, &dropoff))),
            ),
            DeliveryStep::Delivered => (None, None),
        }
    }
}

pub fn waypoints(state: &AppState, order_id: Uuid) -> Result<Waypoints, AppError> {
    let order = state.store.fetch::<Order>(&order_id.to_string())?;
    let pickup = state
        .store
        .get::<Cook>(&order.cook_id.to_string())?
        .and_then(|cook| cook.location);

    Ok(Waypoints {
        pickup,
        dropoff: order.delivery.location,
    })
}

fn accepts_drivers(status: OrderStatus) -> bool {
    matches!(
        status,
        OrderStatus::Accepted | OrderStatus::Preparing | OrderStatus::Ready
    )
}

/// Assigns `order_id` to `driver_id` and opens its tracking document.
///
/// Driver and order are claimed one after the other; if the order claim
/// fails the driver is released again.
pub async fn accept_order(
    state: &AppState,
    driver_id: Uuid,
    order_id: Uuid,
) -> Result<DeliveryTracking, AppError> {
    let order = state.store.fetch::<Order>(&order_id.to_string())?;
    if !accepts_drivers(order.status) {
        return Err(AppError::Conflict(format!(
            "order {} is {} and cannot be picked up",
            order.id, order.status
        )));
    }
    if order.driver_id.is_some() {
        return Err(AppError::Conflict(format!(
            "order {} already has a driver",
            order.id
        )));
    }

    if order.delivery.location.is_none() {
        resolve_dropoff(state, &order).await;
    }

    let driver = state
        .store
        .update::<Driver, _>(&driver_id.to_string(), |driver| {
            if !driver.online {
                return Err(AppError::Conflict(format!("driver {} is offline", driver.id)));
            }
            if !driver.available || driver.has_active_delivery() {
                return Err(AppError::Conflict(format!(
                    "driver {} is already on a delivery",
                    driver.id
                )));
            }
            driver.active_order_id = Some(order_id);
            driver.available = false;
            driver.updated_at = Utc::now();
            Ok(())
        })?;

    let claimed = state
        .store
        .update::<Order, _>(&order_id.to_string(), |order| {
            if order.driver_id.is_some() || !accepts_drivers(order.status) {
                return Err(AppError::Conflict(format!(
                    "order {} was taken by another driver",
                    order.id
                )));
            }
            order.driver_id = Some(driver_id);
            order.updated_at = Utc::now();
            Ok(())
        });

    if let Err(err) = claimed {
        release_driver(state, driver_id, order_id)?;
        return Err(err);
    }

    let now = Utc::now();
    let (eta_pickup, eta_delivery) = match driver.current_location {
        Some(location) => waypoints(state, order_id)?.etas(
            DeliveryStep::HeadingToPickup,
            location.point(),
            &state.config.route,
        ),
        None => (None, None),
    };

    let tracking = DeliveryTracking {
        order_id,
        driver_id,
        last_location: driver.current_location,
        step: DeliveryStep::HeadingToPickup,
        eta_pickup,
        eta_delivery,
        created_at: now,
        updated_at: now,
    };
    state.store.set(&tracking)?;

    info!(order_id = %order_id, driver_id = %driver_id, "order accepted by driver");
    Ok(tracking)
}

async fn resolve_dropoff(state: &AppState, order: &Order) {
    let address = order.delivery.single_line();

    let point = match state.services.geocoder.geocode(&address).await {
        Ok(Some(point)) => point,
        Ok(None) => {
            warn!(order_id = %order.id, address = %address, "delivery address not found");
            return;
        }
        Err(err) => {
            warn!(order_id = %order.id, error = %err, "geocoding delivery address failed");
            return;
        }
    };

    let stored = state
        .store
        .update::<Order, _>(&order.id.to_string(), |order| {
            order.delivery.location.get_or_insert(point);
            Ok(())
        });
    if let Err(err) = stored {
        warn!(order_id = %order.id, error = %err, "failed to store delivery coordinates");
    }
}

/// Moves the tracking document forward. Leaving the kitchen puts the order
/// on its way; reaching `delivered` closes the order and frees the driver.
/// The order moves first, so a refused order transition leaves tracking as
/// it was.
pub fn advance_step(
    state: &AppState,
    order_id: Uuid,
    next: DeliveryStep,
) -> Result<DeliveryTracking, AppError> {
    let key = order_id.to_string();
    let order = state.store.fetch::<Order>(&key)?;
    if order.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "order {} is already {}",
            order.id, order.status
        )));
    }

    let current = state.store.fetch::<DeliveryTracking>(&key)?;
    check_step(current.step, next)?;
    let legs = waypoints(state, order_id)?;

    match next {
        DeliveryStep::HeadingToDelivery if order.status != OrderStatus::Delivering => {
            transition(state, order_id, OrderStatus::Delivering)?;
        }
        DeliveryStep::Delivered => {
            transition(state, order_id, OrderStatus::Delivered)?;
        }
        _ => {}
    }

    let tracking = state
        .store
        .update::<DeliveryTracking, _>(&key, |tracking| {
            check_step(tracking.step, next)?;

            tracking.step = next;
            let (eta_pickup, eta_delivery) = match tracking.last_location {
                Some(location) => legs.etas(next, location.point(), &state.config.route),
                None => (None, None),
            };
            tracking.eta_pickup = eta_pickup;
            tracking.eta_delivery = eta_delivery;
            tracking.updated_at = Utc::now();
            Ok(())
        })?;

    info!(order_id = %order_id, step = next.as_str(), "delivery step advanced");

    if next == DeliveryStep::Delivered {
        release_driver(state, tracking.driver_id, order_id)?;
    }

    Ok(tracking)
}

fn check_step(current: DeliveryStep, next: DeliveryStep) -> Result<(), AppError> {
    if current.can_advance_to(next) {
        Ok(())
    } else {
        Err(AppError::Conflict(format!(
            "delivery cannot go from {} to {}",
            current.as_str(),
            next.as_str()
        )))
    }
}

/// Stops a driver could take now: their own open orders plus ready orders
/// nobody has claimed, sequenced from `start` (or the driver's last fix).
pub async fn plan_route(
    state: &AppState,
    driver_id: Uuid,
    start: Option<GeoPoint>,
) -> Result<OptimizedRoute, AppError> {
    let driver = state.store.fetch::<Driver>(&driver_id.to_string())?;
    let start = start
        .or_else(|| driver.current_location.map(|location| location.point()))
        .ok_or_else(|| {
            AppError::BadRequest(format!("driver {} has no known location", driver.id))
        })?;
    if !start.is_valid() {
        return Err(AppError::BadRequest("start coordinates out of range".to_string()));
    }

    let orders = state
        .store
        .query::<Order>()
        .filter(|order| match order.driver_id {
            Some(assigned) => assigned == driver_id && !order.status.is_terminal(),
            None => order.status == OrderStatus::Ready,
        })
        .fetch();

    let timer = Instant::now();
    let now = Utc::now();
    let (points, unresolved) =
        build_route_points(&orders, state.services.geocoder.as_ref(), now, &state.config.route)
            .await;
    let mut route = sequence(start, points, &state.config.route);
    route.unresolved = unresolved;
    state
        .metrics
        .route_sequencing_seconds
        .observe(timer.elapsed().as_secs_f64());

    info!(
        driver_id = %driver_id,
        stops = route.stops.len(),
        unresolved = route.unresolved.len(),
        distance_km = route.total_distance_km,
        "route planned"
    );
    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_to_pickup_has_both_etas() {
        let legs = Waypoints {
            pickup: Some(GeoPoint {
                lat: -34.6037,
                lng: -58.3816,
            }),
            dropoff: Some(GeoPoint {
                lat: -34.5880,
                lng: -58.3960,
            }),
        };
        let from = GeoPoint {
            lat: -34.6100,
            lng: -58.3700,
        };

        let (pickup, delivery) = legs.etas(DeliveryStep::HeadingToPickup, from, &RouteConfig::default());
        assert!(pickup.is_some());
        assert!(delivery.is_some());

        let (pickup, delivery) = legs.etas(DeliveryStep::HeadingToDelivery, from, &RouteConfig::default());
        assert_eq!(pickup, None);
        assert!(delivery.unwrap().ends_with("min"));

        assert_eq!(
            legs.etas(DeliveryStep::Delivered, from, &RouteConfig::default()),
            (None, None)
        );
    }

    #[test]
    fn unknown_waypoints_give_no_eta() {
        let legs = Waypoints::default();
        let from = GeoPoint { lat: 0.0, lng: 0.0 };
        assert_eq!(
            legs.etas(DeliveryStep::HeadingToPickup, from, &RouteConfig::default()),
            (None, None)
        );
    }
}
