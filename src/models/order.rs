use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::FieldError;
use crate::models::driver::GeoPoint;
use crate::store::{Collection, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    Preparing,
    Ready,
    Delivering,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    /// The forward lifecycle, without the cancelled branch.
    pub const LIFECYCLE: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Accepted,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Delivering,
        OrderStatus::Delivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Accepted => "accepted",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Delivering => "delivering",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Position in [`OrderStatus::LIFECYCLE`]; `None` for cancelled.
    pub fn step_index(&self) -> Option<usize> {
        Self::LIFECYCLE.iter().position(|status| status == self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == OrderStatus::Cancelled {
            return true;
        }

        match (self.step_index(), next.step_index()) {
            (Some(current), Some(target)) => target > current,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(OrderStatus::Pending),
            "accepted" => Ok(OrderStatus::Accepted),
            "preparing" => Ok(OrderStatus::Preparing),
            "ready" => Ok(OrderStatus::Ready),
            "delivering" => Ok(OrderStatus::Delivering),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LineItem {
    pub dish_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: i64,
}

impl LineItem {
    /// `None` when price times quantity does not fit in an `i64`.
    pub fn line_total(&self) -> Option<i64> {
        self.unit_price.checked_mul(i64::from(self.quantity))
    }
}

pub fn items_subtotal(items: &[LineItem]) -> Option<i64> {
    items
        .iter()
        .try_fold(0i64, |sum, item| sum.checked_add(item.line_total()?))
}

pub fn item_count(items: &[LineItem]) -> u32 {
    items
        .iter()
        .fold(0u32, |count, item| count.saturating_add(item.quantity))
}

/// Monetary amounts in whole currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderTotals {
    pub subtotal: i64,
    pub delivery_fee: i64,
    pub service_fee: i64,
    pub total: i64,
}

impl OrderTotals {
    /// Fails with per-field errors when an amount overflows.
    pub fn compute(
        items: &[LineItem],
        delivery_fee: i64,
        service_fee_percent: u32,
    ) -> Result<Self, Vec<FieldError>> {
        let oversized: Vec<FieldError> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.line_total().is_none())
            .map(|(idx, _)| {
                FieldError::new(format!("items[{idx}].unit_price"), "line total is too large")
            })
            .collect();
        if !oversized.is_empty() {
            return Err(oversized);
        }

        let too_large = || vec![FieldError::new("items", "order total is too large")];
        let subtotal = items_subtotal(items).ok_or_else(too_large)?;
        let service_fee = subtotal
            .checked_mul(i64::from(service_fee_percent))
            .map(|fee| fee / 100)
            .ok_or_else(too_large)?;
        let total = subtotal
            .checked_add(delivery_fee)
            .and_then(|sum| sum.checked_add(service_fee))
            .ok_or_else(too_large)?;

        Ok(Self {
            subtotal,
            delivery_fee,
            service_fee,
            total,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeliveryAddress {
    pub street: String,
    pub city: String,
    #[serde(default)]
    pub reference: Option<String>,
    pub phone: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

impl DeliveryAddress {
    /// One-line form used for geocoding and display.
    pub fn single_line(&self) -> String {
        if self.city.trim().is_empty() {
            self.street.trim().to_string()
        } else {
            format!("{}, {}", self.street.trim(), self.city.trim())
        }
    }
}

/// Checkout and payment state of an order. The checkout half is empty when
/// a payment was reported before any checkout was created here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PaymentRef {
    pub preference_id: Option<String>,
    pub init_point: Option<String>,
    pub payment_id: Option<String>,
    pub status: Option<String>,
}

impl PaymentRef {
    pub fn has_checkout(&self) -> bool {
        self.preference_id.is_some() && self.init_point.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub cook_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub items: Vec<LineItem>,
    pub status: OrderStatus,
    pub delivery: DeliveryAddress,
    pub totals: OrderTotals,
    pub payment: Option<PaymentRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_minutes().max(0)
    }
}

impl Document for Order {
    const COLLECTION: Collection = Collection::Orders;

    fn id(&self) -> String {
        self.id.to_string()
    }

    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.items.is_empty() {
            errors.push(FieldError::new("items", "an order needs at least one item"));
        }
        for (idx, item) in self.items.iter().enumerate() {
            if item.quantity == 0 {
                errors.push(FieldError::new(
                    format!("items[{idx}].quantity"),
                    "quantity must be at least 1",
                ));
            }
            if item.unit_price < 0 {
                errors.push(FieldError::new(
                    format!("items[{idx}].unit_price"),
                    "price cannot be negative",
                ));
            }
        }

        if items_subtotal(&self.items) != Some(self.totals.subtotal) {
            errors.push(FieldError::new("totals.subtotal", "subtotal does not match items"));
        }
        let expected_total = self
            .totals
            .subtotal
            .checked_add(self.totals.delivery_fee)
            .and_then(|sum| sum.checked_add(self.totals.service_fee));
        if expected_total != Some(self.totals.total) {
            errors.push(FieldError::new("totals.total", "total does not add up"));
        }

        if self.delivery.street.trim().is_empty() {
            errors.push(FieldError::new("delivery.street", "street cannot be empty"));
        }
        if self.delivery.phone.trim().is_empty() {
            errors.push(FieldError::new("delivery.phone", "phone cannot be empty"));
        }
        if self.delivery.location.is_some_and(|point| !point.is_valid()) {
            errors.push(FieldError::new("delivery.location", "coordinates out of range"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
