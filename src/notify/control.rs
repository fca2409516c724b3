//! Control messages a client worker can send over its socket, mirroring the
//! messages a page posts to its service worker.

use serde::{Deserialize, Serialize};

use super::{content_for, NotificationContent, NotificationContext, NotificationPermission};

pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    SkipWaiting,
    GetVersion,
    ShowNotification {
        status: String,
        #[serde(default)]
        context: NotificationContext,
    },
    SetPermission {
        permission: NotificationPermission,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Activated,
    Version { version: &'static str },
    Notification { content: NotificationContent },
    PermissionUpdated { permission: NotificationPermission },
    Error { message: String },
}

pub fn parse(raw: &str) -> ControlReply {
    match serde_json::from_str::<ControlCommand>(raw) {
        Ok(command) => reply_to(&command),
        Err(err) => ControlReply::Error {
            message: format!("unrecognized command: {err}"),
        },
    }
}

/// Builds the reply for a command. Permission changes are applied by the
/// caller, which knows whose permission it is.
pub fn reply_to(command: &ControlCommand) -> ControlReply {
    match command {
        ControlCommand::SkipWaiting => ControlReply::Activated,
        ControlCommand::GetVersion => ControlReply::Version {
            version: WORKER_VERSION,
        },
        ControlCommand::ShowNotification { status, context } => ControlReply::Notification {
            content: content_for(status, context),
        },
        ControlCommand::SetPermission { permission } => ControlReply::PermissionUpdated {
            permission: *permission,
        },
    }
}
