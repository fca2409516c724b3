use std::sync::Arc;

use axum::extract::State;
use axum::routing::{post, put};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, ErrorResponse, FieldError};
use crate::notify::mail::{looks_like_email, EmailMessage};
use crate::notify::{content_for, NotificationContent, NotificationContext, NotificationPermission};
use crate::state::AppState;

const MAX_SUBJECT_CHARS: usize = 200;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/notifications/email", post(send_email))
        .route("/api/notifications/preview", post(preview))
        .route("/api/notifications/permission", put(set_permission))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EmailRequest {
    pub to: String,
    pub subject: String,
    pub text: String,
}

impl EmailRequest {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        if !looks_like_email(&self.to) {
            errors.push(FieldError::new("to", "not a valid email address"));
        }
        if self.subject.trim().is_empty() {
            errors.push(FieldError::new("subject", "subject cannot be empty"));
        } else if self.subject.chars().count() > MAX_SUBJECT_CHARS {
            errors.push(FieldError::new("subject", "subject is too long"));
        }
        if self.text.trim().is_empty() {
            errors.push(FieldError::new("text", "message cannot be empty"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EmailSent {
    pub sent: bool,
}

#[utoipa::path(
    post,
    path = "/api/notifications/email",
    tag = "Notifications",
    request_body = EmailRequest,
    responses(
        (status = 200, description = "Message handed to the mail service", body = EmailSent),
        (status = 400, description = "Invalid message", body = ErrorResponse),
        (status = 500, description = "Mail service failed", body = ErrorResponse),
        (status = 503, description = "Mail is not configured", body = ErrorResponse),
    )
)]
pub async fn send_email(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EmailRequest>,
) -> Result<Json<EmailSent>, AppError> {
    payload.validate().map_err(AppError::Validation)?;

    let mailer = state
        .services
        .mailer
        .clone()
        .ok_or_else(|| AppError::ServiceUnavailable("email is not configured".to_string()))?;

    let message = EmailMessage {
        from: state.config.mailer.from.clone(),
        to: payload.to.trim().to_string(),
        subject: payload.subject.trim().to_string(),
        text: payload.text,
    };

    if let Err(err) = mailer.send(&message).await {
        error!(to = %message.to, error = %err, "email delivery failed");
        return Err(err);
    }

    info!(to = %message.to, "email sent");
    Ok(Json(EmailSent { sent: true }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PreviewRequest {
    pub status: String,
    #[serde(default)]
    pub context: NotificationContext,
}

#[utoipa::path(
    post,
    path = "/api/notifications/preview",
    tag = "Notifications",
    request_body = PreviewRequest,
    responses((status = 200, description = "Notification copy for the status", body = NotificationContent))
)]
pub async fn preview(Json(payload): Json<PreviewRequest>) -> Json<NotificationContent> {
    Json(content_for(&payload.status, &payload.context))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PermissionUpdate {
    pub customer_id: Uuid,
    pub permission: NotificationPermission,
}

#[utoipa::path(
    put,
    path = "/api/notifications/permission",
    tag = "Notifications",
    request_body = PermissionUpdate,
    responses((status = 200, description = "Permission stored", body = PermissionUpdate))
)]
pub async fn set_permission(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PermissionUpdate>,
) -> Json<PermissionUpdate> {
    state
        .dispatcher
        .set_permission(payload.customer_id, payload.permission);
    Json(payload)
}
