use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    High,
    Medium,
    Low,
}

/// One delivery stop, built from an order for sequencing. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RoutePoint {
    pub order_id: Uuid,
    pub address: String,
    pub location: GeoPoint,
    pub priority: PriorityTier,
    pub service_minutes: f64,
    pub total: i64,
    pub waiting_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RouteStop {
    pub sequence: usize,
    #[serde(flatten)]
    pub point: RoutePoint,
    pub leg_km: f64,
    pub arrival_minute: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct UnresolvedStop {
    pub order_id: Uuid,
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OptimizedRoute {
    pub start: GeoPoint,
    pub stops: Vec<RouteStop>,
    pub unresolved: Vec<UnresolvedStop>,
    pub total_distance_km: f64,
    pub total_minutes: f64,
    pub fuel_cost: f64,
    pub efficiency: u8,
}
