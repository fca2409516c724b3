use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::FieldError;
use crate::models::driver::{GeoPoint, RatingSummary};
use crate::store::{Collection, Document};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Cook {
    pub id: Uuid,
    pub name: String,
    pub kitchen_name: String,
    pub available: bool,
    pub location: Option<GeoPoint>,
    pub rating: RatingSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document for Cook {
    const COLLECTION: Collection = Collection::Cooks;

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(FieldError::new("name", "name cannot be empty"));
        }
        if self.kitchen_name.trim().is_empty() {
            errors.push(FieldError::new("kitchen_name", "kitchen name cannot be empty"));
        }
        if self.location.is_some_and(|point| !point.is_valid()) {
            errors.push(FieldError::new("location", "coordinates out of range"));
        }
        self.rating.field_errors("rating", &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
