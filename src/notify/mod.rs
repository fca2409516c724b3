//! Order-status notifications: the Spanish copy for each status and the
//! dispatcher that decides where (and whether) to show them.

pub mod control;
pub mod mail;

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NotificationContext {
    #[serde(default)]
    pub cook_name: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub eta: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub actions: Vec<NotificationAction>,
    pub require_interaction: bool,
}

fn action(action: &str, title: &str) -> NotificationAction {
    NotificationAction {
        action: action.to_string(),
        title: title.to_string(),
    }
}

/// Maps a status key to its notification. Unknown keys get a generic update
/// so every input yields a non-empty title and body.
pub fn content_for(status: &str, ctx: &NotificationContext) -> NotificationContent {
    let cook = ctx
        .cook_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or("el cocinero");
    let driver = ctx
        .driver_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or("Tu repartidor");
    let eta = ctx.eta.as_deref().filter(|eta| !eta.trim().is_empty());

    let view = action("view", "Ver pedido");

    let (title, body, icon, actions, require_interaction) = match status {
        "pending" => (
            "Pedido recibido".to_string(),
            format!("Enviamos tu pedido a {cook}. Te avisaremos cuando lo confirme."),
            "pending",
            vec![view],
            false,
        ),
        "accepted" => (
            "¡Pedido aceptado!".to_string(),
            format!("{} aceptó tu pedido.", capitalize(cook)),
            "accepted",
            vec![view],
            false,
        ),
        "preparing" => (
            "Preparando tu comida".to_string(),
            format!("{} está cocinando tu pedido.", capitalize(cook)),
            "preparing",
            vec![view],
            false,
        ),
        "ready" => (
            "Pedido listo".to_string(),
            "Tu pedido está listo y pronto saldrá hacia tu dirección.".to_string(),
            "ready",
            vec![view],
            false,
        ),
        "delivering" => (
            "¡Tu pedido va en camino!".to_string(),
            match eta {
                Some(eta) => format!("{driver} llega en aproximadamente {eta}."),
                None => format!("{driver} está en camino con tu pedido."),
            },
            "delivering",
            vec![action("track", "Seguir pedido"), view],
            true,
        ),
        "delivered" => (
            "¡Pedido entregado!".to_string(),
            "Tu pedido fue entregado. ¡Buen provecho!".to_string(),
            "delivered",
            vec![action("rate", "Calificar"), view],
            true,
        ),
        "cancelled" => (
            "Pedido cancelado".to_string(),
            "Tu pedido fue cancelado. Si ya pagaste, el reembolso se procesará automáticamente."
                .to_string(),
            "cancelled",
            vec![action("support", "Contactar soporte")],
            true,
        ),
        _ => (
            "Actualización de tu pedido".to_string(),
            "El estado de tu pedido cambió. Abrí la app para ver los detalles.".to_string(),
            "default",
            vec![view],
            false,
        ),
    };

    NotificationContent {
        title,
        body,
        icon: format!("/icons/order-{icon}.png"),
        badge: "/icons/badge-72x72.png".to_string(),
        tag: format!("order-{icon}"),
        actions,
        require_interaction,
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPermission {
    Granted,
    Denied,
    #[default]
    Default,
}

/// A notification addressed to the watchers of one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub status: String,
    pub content: NotificationContent,
}

pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn show(&self, notification: &Notification) -> Result<(), AppError>;
}

/// Pushes to clients watching the notification's order. Fails when that
/// order has no watcher, even if other orders do.
pub struct PushSink {
    tx: broadcast::Sender<Notification>,
    watchers: Arc<DashMap<Uuid, usize>>,
}

impl PushSink {
    pub fn new(buffer: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            watchers: Arc::new(DashMap::new()),
        }
    }

    pub fn watch(&self, order_id: Uuid) -> OrderWatch {
        let rx = self.tx.subscribe();
        *self.watchers.entry(order_id).or_insert(0) += 1;
        OrderWatch {
            order_id,
            rx,
            watchers: self.watchers.clone(),
        }
    }

    pub fn watcher_count(&self, order_id: Uuid) -> usize {
        self.watchers.get(&order_id).map_or(0, |count| *count)
    }
}

impl NotificationSink for PushSink {
    fn name(&self) -> &'static str {
        "push"
    }

    fn show(&self, notification: &Notification) -> Result<(), AppError> {
        if self.watcher_count(notification.order_id) == 0 {
            return Err(AppError::ServiceUnavailable(format!(
                "no watchers for order {}",
                notification.order_id
            )));
        }

        self.tx
            .send(notification.clone())
            .map(|_| ())
            .map_err(|_| AppError::ServiceUnavailable("no push subscribers".to_string()))
    }
}

/// A registered watcher of one order's notifications. Dropping it
/// unregisters the watcher.
pub struct OrderWatch {
    order_id: Uuid,
    rx: broadcast::Receiver<Notification>,
    watchers: Arc<DashMap<Uuid, usize>>,
}

impl OrderWatch {
    pub fn order_id(&self) -> Uuid {
        self.order_id
    }

    /// Next notification for the watched order; other orders are skipped.
    pub async fn recv(&mut self) -> Result<Notification, broadcast::error::RecvError> {
        loop {
            let notification = self.rx.recv().await?;
            if notification.order_id == self.order_id {
                return Ok(notification);
            }
        }
    }
}

impl Drop for OrderWatch {
    fn drop(&mut self) {
        let emptied = match self.watchers.get_mut(&self.order_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if emptied {
            self.watchers.remove_if(&self.order_id, |_, count| *count == 0);
        }
    }
}

/// Local fallback: writes the notification to the log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn show(&self, notification: &Notification) -> Result<(), AppError> {
        info!(
            order_id = %notification.order_id,
            customer_id = %notification.customer_id,
            title = %notification.content.title,
            body = %notification.content.body,
            "notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DispatchOutcome {
    /// Permission was not granted.
    Skipped,
    Shown { sink: &'static str },
    FellBack { sink: &'static str },
    Failed,
}

pub struct Dispatcher {
    push: Arc<PushSink>,
    primary: Arc<dyn NotificationSink>,
    fallback: Arc<dyn NotificationSink>,
    permissions: DashMap<Uuid, NotificationPermission>,
}

impl Dispatcher {
    pub fn new(buffer: usize) -> Self {
        let push = Arc::new(PushSink::new(buffer));
        Self {
            primary: push.clone(),
            push,
            fallback: Arc::new(LogSink),
            permissions: DashMap::new(),
        }
    }

    /// Replaces the sinks; the push channel stays available to subscribers.
    pub fn with_sinks(
        mut self,
        primary: Arc<dyn NotificationSink>,
        fallback: Arc<dyn NotificationSink>,
    ) -> Self {
        self.primary = primary;
        self.fallback = fallback;
        self
    }

    /// Registers a watcher for `order_id` on the push channel.
    pub fn watch(&self, order_id: Uuid) -> OrderWatch {
        self.push.watch(order_id)
    }

    pub fn watcher_count(&self, order_id: Uuid) -> usize {
        self.push.watcher_count(order_id)
    }

    pub fn permission(&self, customer_id: Uuid) -> NotificationPermission {
        self.permissions
            .get(&customer_id)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    pub fn set_permission(&self, customer_id: Uuid, permission: NotificationPermission) {
        self.permissions.insert(customer_id, permission);
    }

    pub fn dispatch(&self, notification: &Notification) -> DispatchOutcome {
        if self.permission(notification.customer_id) != NotificationPermission::Granted {
            return DispatchOutcome::Skipped;
        }

        match self.primary.show(notification) {
            Ok(()) => DispatchOutcome::Shown {
                sink: self.primary.name(),
            },
            Err(primary_err) => {
                warn!(
                    order_id = %notification.order_id,
                    sink = self.primary.name(),
                    error = %primary_err,
                    "primary notification sink failed; using fallback"
                );
                match self.fallback.show(notification) {
                    Ok(()) => DispatchOutcome::FellBack {
                        sink: self.fallback.name(),
                    },
                    Err(err) => {
                        warn!(order_id = %notification.order_id, error = %err, "notification dropped");
                        DispatchOutcome::Failed
                    }
                }
            }
        }
    }
}
