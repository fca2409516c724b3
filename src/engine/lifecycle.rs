//! Order progress as shown to customers: which lifecycle steps are done,
//! which one is in progress, and how long ago the order was placed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Completed,
    Current,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ProgressStep {
    pub status: OrderStatus,
    pub label: String,
    pub state: StepState,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OrderProgress {
    pub status: OrderStatus,
    pub steps: Vec<ProgressStep>,
    pub message: String,
    pub elapsed: String,
}

impl OrderProgress {
    pub fn current(&self) -> Option<&ProgressStep> {
        self.steps
            .iter()
            .find(|step| step.state == StepState::Current)
    }
}

pub fn step_label(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "Pedido realizado",
        OrderStatus::Accepted => "Pedido aceptado",
        OrderStatus::Preparing => "En preparación",
        OrderStatus::Ready => "Listo para retirar",
        OrderStatus::Delivering => "En camino",
        OrderStatus::Delivered => "Entregado",
        OrderStatus::Cancelled => "Cancelado",
    }
}

pub fn status_message(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "Esperando que el cocinero confirme tu pedido",
        OrderStatus::Accepted => "El cocinero aceptó tu pedido",
        OrderStatus::Preparing => "Tu comida se está preparando",
        OrderStatus::Ready => "Tu pedido está listo y espera al repartidor",
        OrderStatus::Delivering => "El repartidor va en camino con tu pedido",
        OrderStatus::Delivered => "¡Tu pedido fue entregado! Buen provecho",
        OrderStatus::Cancelled => "Tu pedido fue cancelado",
    }
}

pub fn elapsed_since(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - created_at).num_minutes().max(0);

    match minutes {
        0 => "Hace un momento".to_string(),
        m if m < 60 => format!("Hace {m} min"),
        m if m < 24 * 60 => {
            let (hours, rest) = (m / 60, m % 60);
            if rest == 0 {
                format!("Hace {hours} h")
            } else {
                format!("Hace {hours} h {rest} min")
            }
        }
        m => format!("Hace {} d", m / (24 * 60)),
    }
}

pub fn progress(
    status: OrderStatus,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> OrderProgress {
    let steps = match status.step_index() {
        Some(current) => OrderStatus::LIFECYCLE
            .iter()
            .enumerate()
            .map(|(idx, step)| {
                let state = if idx < current || status == OrderStatus::Delivered {
                    StepState::Completed
                } else if idx == current {
                    StepState::Current
                } else {
                    StepState::Pending
                };
                ProgressStep {
                    status: *step,
                    label: step_label(*step).to_string(),
                    state,
                }
            })
            .collect(),
        None => cancelled_steps(),
    };

    OrderProgress {
        status,
        steps,
        message: status_message(status).to_string(),
        elapsed: elapsed_since(created_at, now),
    }
}

/// Placement stays completed, the rest go neutral, and a terminal
/// cancelled step is appended as the only current one.
fn cancelled_steps() -> Vec<ProgressStep> {
    let mut steps: Vec<ProgressStep> = OrderStatus::LIFECYCLE
        .iter()
        .enumerate()
        .map(|(idx, step)| ProgressStep {
            status: *step,
            label: step_label(*step).to_string(),
            state: if idx == 0 {
                StepState::Completed
            } else {
                StepState::Pending
            },
        })
        .collect();

    steps.push(ProgressStep {
        status: OrderStatus::Cancelled,
        label: step_label(OrderStatus::Cancelled).to_string(),
        state: StepState::Current,
    });
    steps
}
