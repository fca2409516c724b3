use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::SinkExt;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::lifecycle::{progress, OrderProgress};
use crate::error::AppError;
use crate::models::order::Order;
use crate::models::tracking::DeliveryTracking;
use crate::notify::control::{self, ControlReply};
use crate::notify::Notification;
use crate::state::AppState;
use crate::store::ChangeEvent;

const REPLY_BUFFER: usize = 32;

/// Everything pushed to an order's watchers.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ServerEvent {
    OrderChanged {
        change: ChangeEvent<Order>,
        progress: Option<OrderProgress>,
    },
    TrackingChanged {
        change: ChangeEvent<DeliveryTracking>,
    },
    Notification {
        notification: Notification,
    },
    Control {
        reply: ControlReply,
    },
}

impl ServerEvent {
    fn order(change: ChangeEvent<Order>) -> Self {
        let progress = match &change {
            ChangeEvent::Upserted { document, .. } => {
                Some(progress(document.status, document.created_at, Utc::now()))
            }
            ChangeEvent::Removed { .. } => None,
        };
        ServerEvent::OrderChanged { change, progress }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let order = state.store.fetch::<Order>(&order_id.to_string())?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, order))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, order: Order) {
    let (mut sender, mut receiver) = socket.split();
    let order_id = order.id;
    let customer_id = order.customer_id;

    // Subscribe before sending the snapshot so no write falls in between.
    let mut orders = state.store.subscribe::<Order>(&order_id.to_string());
    let mut tracking = state
        .store
        .subscribe::<DeliveryTracking>(&order_id.to_string());
    let mut notifications = state.dispatcher.watch(order_id);
    let (reply_tx, mut reply_rx) = mpsc::channel::<ControlReply>(REPLY_BUFFER);

    info!(order_id = %order_id, "websocket client connected");

    let snapshot = ServerEvent::order(ChangeEvent::Upserted {
        revision: 0,
        document: order,
    });

    let mut send_task = tokio::spawn(async move {
        let mut next_event = Some(snapshot);

        loop {
            let event = match next_event.take() {
                Some(event) => event,
                None => tokio::select! {
                    Some(change) = orders.next() => ServerEvent::order(change),
                    Some(change) = tracking.next() => ServerEvent::TrackingChanged { change },
                    Some(reply) = reply_rx.recv() => ServerEvent::Control { reply },
                    received = notifications.recv() => match received {
                        Ok(notification) => ServerEvent::Notification { notification },
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(order_id = %order_id, skipped, "websocket lagged behind notifications");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                },
            };

            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let reply = control::parse(&text);
            match &reply {
                ControlReply::PermissionUpdated { permission } => {
                    recv_state
                        .dispatcher
                        .set_permission(customer_id, *permission);
                }
                ControlReply::Error { message } => {
                    debug!(order_id = %order_id, message = %message, "bad control command");
                }
                _ => {}
            }

            if reply_tx.send(reply).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(order_id = %order_id, "websocket client disconnected");
}
