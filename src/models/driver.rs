use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::FieldError;
use crate::store::{Collection, Document};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A position with the time the device reported it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TrackedLocation {
    pub lat: f64,
    pub lng: f64,
    pub recorded_at: DateTime<Utc>,
}

impl TrackedLocation {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VehicleKind {
    Bicycle,
    Motorcycle,
    Car,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Vehicle {
    pub kind: VehicleKind,
    pub plate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct RatingSummary {
    pub average: f64,
    pub count: u32,
}

impl RatingSummary {
    pub(crate) fn field_errors(&self, prefix: &str, errors: &mut Vec<FieldError>) {
        if !(0.0..=5.0).contains(&self.average) {
            errors.push(FieldError::new(
                format!("{prefix}.average"),
                "rating must be between 0 and 5",
            ));
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub online: bool,
    pub available: bool,
    pub sharing_location: bool,
    pub current_location: Option<TrackedLocation>,
    pub vehicle: Vehicle,
    pub rating: RatingSummary,
    pub active_order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    pub fn has_active_delivery(&self) -> bool {
        self.active_order_id.is_some()
    }
}

impl Document for Driver {
    const COLLECTION: Collection = Collection::Drivers;

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(FieldError::new("name", "name cannot be empty"));
        }
        if self.phone.trim().is_empty() {
            errors.push(FieldError::new("phone", "phone cannot be empty"));
        }
        if let Some(location) = &self.current_location {
            if !location.point().is_valid() {
                errors.push(FieldError::new(
                    "current_location",
                    "coordinates out of range",
                ));
            }
        }
        if self.vehicle.kind != VehicleKind::Bicycle
            && self
                .vehicle
                .plate
                .as_deref()
                .map_or(true, |plate| plate.trim().is_empty())
        {
            errors.push(FieldError::new(
                "vehicle.plate",
                "motor vehicles need a plate",
            ));
        }
        self.rating.field_errors("rating", &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
