use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::cook::Cook;
use crate::models::driver::Driver;
use crate::models::order::{DeliveryAddress, LineItem, Order, OrderStatus, OrderTotals};
use crate::models::tracking::DeliveryTracking;
use crate::notify::{content_for, DispatchOutcome, Notification, NotificationContext};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewOrder {
    pub customer_id: Uuid,
    pub cook_id: Uuid,
    pub items: Vec<LineItem>,
    pub delivery: DeliveryAddress,
}

pub fn create_order(state: &AppState, new_order: NewOrder) -> Result<Order, AppError> {
    let cook = state.store.fetch::<Cook>(&new_order.cook_id.to_string())?;
    if !cook.available {
        return Err(AppError::Conflict(format!(
            "cook {} is not taking orders",
            cook.id
        )));
    }

    let now = Utc::now();
    let totals = OrderTotals::compute(
        &new_order.items,
        state.config.fees.delivery_fee,
        state.config.fees.service_fee_percent,
    )
    .map_err(AppError::Validation)?;

    let order = Order {
        id: Uuid::new_v4(),
        customer_id: new_order.customer_id,
        cook_id: cook.id,
        driver_id: None,
        items: new_order.items,
        status: OrderStatus::Pending,
        delivery: new_order.delivery,
        totals,
        payment: None,
        created_at: now,
        updated_at: now,
        delivered_at: None,
    };

    state.store.create(&order)?;
    state.metrics.orders_created_total.inc();

    info!(
        order_id = %order.id,
        cook_id = %order.cook_id,
        total = order.totals.total,
        "order created"
    );

    Ok(order)
}

/// Moves an order to `next`, then notifies the customer. Illegal moves are
/// a conflict and leave the order untouched.
pub fn transition(state: &AppState, order_id: Uuid, next: OrderStatus) -> Result<Order, AppError> {
    let order = state
        .store
        .update::<Order, _>(&order_id.to_string(), |order| {
            if !order.status.can_transition_to(next) {
                return Err(AppError::Conflict(format!(
                    "order {} cannot move from {} to {}",
                    order.id, order.status, next
                )));
            }

            let now = Utc::now();
            order.status = next;
            order.updated_at = now;
            if next == OrderStatus::Delivered {
                order.delivered_at = Some(now);
            }
            Ok(())
        })?;

    state
        .metrics
        .order_transitions_total
        .with_label_values(&[next.as_str()])
        .inc();
    info!(order_id = %order.id, status = %next, "order status changed");

    if next == OrderStatus::Cancelled {
        if let Some(driver_id) = order.driver_id {
            release_driver(state, driver_id, order.id)?;
        }
    }

    notify(state, &order);
    Ok(order)
}

/// Frees a driver whose active order was `order_id`.
pub fn release_driver(state: &AppState, driver_id: Uuid, order_id: Uuid) -> Result<(), AppError> {
    state
        .store
        .update::<Driver, _>(&driver_id.to_string(), |driver| {
            if driver.active_order_id == Some(order_id) {
                driver.active_order_id = None;
                driver.available = true;
                driver.updated_at = Utc::now();
            }
            Ok(())
        })?;
    Ok(())
}

/// Names and ETA for the notification copy. Lookups that fail only make
/// the copy more generic.
pub fn notification_context(state: &AppState, order: &Order) -> NotificationContext {
    let cook_name = state
        .store
        .get::<Cook>(&order.cook_id.to_string())
        .ok()
        .flatten()
        .map(|cook| cook.name);

    let driver_name = order.driver_id.and_then(|driver_id| {
        state
            .store
            .get::<Driver>(&driver_id.to_string())
            .ok()
            .flatten()
            .map(|driver| driver.name)
    });

    let eta = state
        .store
        .get::<DeliveryTracking>(&order.id.to_string())
        .ok()
        .flatten()
        .and_then(|tracking| tracking.eta_delivery.or(tracking.eta_pickup));

    NotificationContext {
        cook_name,
        driver_name,
        eta,
    }
}

pub fn notify(state: &AppState, order: &Order) -> DispatchOutcome {
    let ctx = notification_context(state, order);
    let notification = Notification {
        order_id: order.id,
        customer_id: order.customer_id,
        status: order.status.as_str().to_string(),
        content: content_for(order.status.as_str(), &ctx),
    };

    let outcome = state.dispatcher.dispatch(&notification);
    let label = match outcome {
        DispatchOutcome::Skipped => "skipped",
        DispatchOutcome::Shown { .. } => "shown",
        DispatchOutcome::FellBack { .. } => "fell_back",
        DispatchOutcome::Failed => {
            warn!(order_id = %order.id, "status notification could not be shown");
            "failed"
        }
    };
    state
        .metrics
        .notifications_total
        .with_label_values(&[label])
        .inc();

    outcome
}
