use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::geo::geocode::Geocoder;
use crate::geo::{haversine_km, travel_minutes, AVERAGE_SPEED_KMH};
use crate::models::driver::GeoPoint;
use crate::models::order::{item_count, Order};
use crate::models::route::{OptimizedRoute, PriorityTier, RoutePoint, RouteStop, UnresolvedStop};

/// Tunables for tiering, timing and the efficiency score.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteConfig {
    pub high_value_threshold: i64,
    pub high_wait_minutes: i64,
    pub medium_value_threshold: i64,
    pub medium_wait_minutes: i64,
    pub high_multiplier: f64,
    pub medium_multiplier: f64,
    pub low_multiplier: f64,
    pub speed_kmh: f64,
    pub base_service_minutes: f64,
    pub items_per_extra_minute: u32,
    pub fuel_cost_per_km: f64,
    pub long_leg_km: f64,
    pub long_leg_penalty_per_km: f64,
    pub long_leg_penalty_cap: f64,
    pub late_high_priority_penalty: f64,
    pub late_high_priority_cap: f64,
    pub long_route_km: f64,
    pub long_route_penalty_per_km: f64,
    pub long_route_penalty_cap: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            high_value_threshold: 25_000,
            high_wait_minutes: 45,
            medium_value_threshold: 15_000,
            medium_wait_minutes: 20,
            high_multiplier: 0.7,
            medium_multiplier: 1.0,
            low_multiplier: 1.3,
            speed_kmh: AVERAGE_SPEED_KMH,
            base_service_minutes: 5.0,
            items_per_extra_minute: 3,
            fuel_cost_per_km: 250.0,
            long_leg_km: 2.0,
            long_leg_penalty_per_km: 10.0,
            long_leg_penalty_cap: 30.0,
            late_high_priority_penalty: 5.0,
            late_high_priority_cap: 20.0,
            long_route_km: 15.0,
            long_route_penalty_per_km: 2.0,
            long_route_penalty_cap: 30.0,
        }
    }
}

pub fn priority_tier(total: i64, age_minutes: i64, config: &RouteConfig) -> PriorityTier {
    if total > config.high_value_threshold || age_minutes > config.high_wait_minutes {
        PriorityTier::High
    } else if total > config.medium_value_threshold || age_minutes > config.medium_wait_minutes {
        PriorityTier::Medium
    } else {
        PriorityTier::Low
    }
}

pub fn priority_multiplier(tier: PriorityTier, config: &RouteConfig) -> f64 {
    match tier {
        PriorityTier::High => config.high_multiplier,
        PriorityTier::Medium => config.medium_multiplier,
        PriorityTier::Low => config.low_multiplier,
    }
}

pub fn service_minutes(items: u32, config: &RouteConfig) -> f64 {
    let extra = items
        .checked_div(config.items_per_extra_minute)
        .unwrap_or_default();
    config.base_service_minutes + f64::from(extra)
}

pub fn route_point(
    order: &Order,
    location: GeoPoint,
    now: DateTime<Utc>,
    config: &RouteConfig,
) -> RoutePoint {
    let waiting_minutes = order.age_minutes(now);

    RoutePoint {
        order_id: order.id,
        address: order.delivery.single_line(),
        location,
        priority: priority_tier(order.totals.total, waiting_minutes, config),
        service_minutes: service_minutes(item_count(&order.items), config),
        total: order.totals.total,
        waiting_minutes,
    }
}

/// Resolves each order's drop-off coordinate, preferring coordinates stored
/// on the order. Orders that cannot be placed are returned separately.
pub async fn build_route_points(
    orders: &[Order],
    geocoder: &dyn Geocoder,
    now: DateTime<Utc>,
    config: &RouteConfig,
) -> (Vec<RoutePoint>, Vec<UnresolvedStop>) {
    let mut points = Vec::with_capacity(orders.len());
    let mut unresolved = Vec::new();

    for order in orders {
        let address = order.delivery.single_line();

        let location = match order.delivery.location {
            Some(location) => Ok(Some(location)),
            None => geocoder.geocode(&address).await,
        };

        match location {
            Ok(Some(location)) => points.push(route_point(order, location, now, config)),
            Ok(None) => unresolved.push(UnresolvedStop {
                order_id: order.id,
                address,
                reason: "address not found".to_string(),
            }),
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "geocoding failed; stop left out of route");
                unresolved.push(UnresolvedStop {
                    order_id: order.id,
                    address,
                    reason: err.to_string(),
                });
            }
        }
    }

    (points, unresolved)
}

/// Greedy nearest-neighbour ordering where each candidate's distance is
/// scaled by its priority multiplier.
pub fn sequence(start: GeoPoint, points: Vec<RoutePoint>, config: &RouteConfig) -> OptimizedRoute {
    let mut remaining = points;
    let mut stops = Vec::with_capacity(remaining.len());
    let mut current = start;
    let mut total_distance_km = 0.0;
    let mut clock_minutes = 0.0;

    while !remaining.is_empty() {
        let next_idx = remaining
            .iter()
            .enumerate()
            .map(|(idx, point)| {
                let weighted = haversine_km(&current, &point.location)
                    * priority_multiplier(point.priority, config);
                (idx, weighted)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(idx, _)| idx)
            .unwrap_or_default();

        let point = remaining.remove(next_idx);
        let leg_km = haversine_km(&current, &point.location);
        total_distance_km += leg_km;
        clock_minutes += travel_minutes(leg_km, config.speed_kmh);

        current = point.location;
        let service = point.service_minutes;
        stops.push(RouteStop {
            sequence: stops.len() + 1,
            point,
            leg_km,
            arrival_minute: clock_minutes,
        });
        clock_minutes += service;
    }

    let efficiency = efficiency(&stops, total_distance_km, config);

    OptimizedRoute {
        start,
        stops,
        unresolved: Vec::new(),
        total_distance_km,
        total_minutes: clock_minutes,
        fuel_cost: total_distance_km * config.fuel_cost_per_km,
        efficiency,
    }
}

/// 0..=100; penalizes long average legs, high-priority stops left for the
/// second half of the route, and long routes overall.
pub fn efficiency(stops: &[RouteStop], total_distance_km: f64, config: &RouteConfig) -> u8 {
    if stops.is_empty() {
        return 100;
    }

    let mut score = 100.0;

    let average_leg = total_distance_km / stops.len() as f64;
    if average_leg > config.long_leg_km {
        score -= ((average_leg - config.long_leg_km) * config.long_leg_penalty_per_km)
            .min(config.long_leg_penalty_cap);
    }

    if stops.len() > 1 {
        let late_high = stops
            .iter()
            .enumerate()
            .filter(|(idx, stop)| idx * 2 >= stops.len() && stop.point.priority == PriorityTier::High)
            .count();
        score -= (late_high as f64 * config.late_high_priority_penalty)
            .min(config.late_high_priority_cap);
    }

    if total_distance_km > config.long_route_km {
        score -= ((total_distance_km - config.long_route_km) * config.long_route_penalty_per_km)
            .min(config.long_route_penalty_cap);
    }

    score.clamp(0.0, 100.0).round() as u8
}

/// True when `route` visits every point exactly once.
pub fn is_permutation_of(route: &OptimizedRoute, points: &[RoutePoint]) -> bool {
    let visited: HashSet<_> = route.stops.iter().map(|stop| stop.point.order_id).collect();
    let expected: HashSet<_> = points.iter().map(|point| point.order_id).collect();
    route.stops.len() == points.len() && visited == expected
}
