use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::FieldError;
use crate::models::driver::TrackedLocation;
use crate::store::{Collection, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStep {
    HeadingToPickup,
    AtPickup,
    HeadingToDelivery,
    Delivered,
}

impl DeliveryStep {
    pub const SEQUENCE: [DeliveryStep; 4] = [
        DeliveryStep::HeadingToPickup,
        DeliveryStep::AtPickup,
        DeliveryStep::HeadingToDelivery,
        DeliveryStep::Delivered,
    ];

    fn index(&self) -> usize {
        Self::SEQUENCE
            .iter()
            .position(|step| step == self)
            .unwrap_or_default()
    }

    pub fn can_advance_to(&self, next: DeliveryStep) -> bool {
        next.index() > self.index()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStep::HeadingToPickup => "heading_to_pickup",
            DeliveryStep::AtPickup => "at_pickup",
            DeliveryStep::HeadingToDelivery => "heading_to_delivery",
            DeliveryStep::Delivered => "delivered",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeliveryTracking {
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub last_location: Option<TrackedLocation>,
    pub step: DeliveryStep,
    pub eta_pickup: Option<String>,
    pub eta_delivery: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document for DeliveryTracking {
    const COLLECTION: Collection = Collection::DeliveryTracking;

    fn id(&self) -> String {
        self.order_id.to_string()
    }

    fn validate(&self) -> Result<(), Vec<FieldError>> {
        match &self.last_location {
            Some(location) if !location.point().is_valid() => Err(vec![FieldError::new(
                "last_location",
                "coordinates out of range",
            )]),
            _ => Ok(()),
        }
    }
}
