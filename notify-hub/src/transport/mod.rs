//! Real-time transport seam.
//!
//! The engine never talks to a socket directly. Inbound traffic reaches it
//! as a stream of [`TransportSignal`]s; outbound traffic (room joins and
//! read/clear acknowledgements) goes through the [`Transport`] trait.

mod local;

pub use local::{LocalBus, LocalSession};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::Result;
use crate::notification::events::{ACK_ALL_READ, ACK_CLEARED, ACK_NOTIFICATION_READ};
use crate::notification::routing::{Role, ViewerScope};

/// Room subscription request sent on (re)connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoin {
    pub user_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chef_id: Option<String>,
    pub rooms: Vec<String>,
}

impl From<&ViewerScope> for RoomJoin {
    fn from(scope: &ViewerScope) -> Self {
        Self {
            user_id: scope.user_id.clone(),
            role: scope.role,
            branch_id: scope.branch_id.clone(),
            department_id: scope.department_id.clone(),
            chef_id: scope.chef_id.clone(),
            rooms: scope.rooms(),
        }
    }
}

/// Acknowledgements the engine emits after a local lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundEvent {
    NotificationRead { id: String, user_id: String },
    AllRead { user_id: String },
    Cleared { user_id: String },
}

impl OutboundEvent {
    /// Wire event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotificationRead { .. } => ACK_NOTIFICATION_READ,
            Self::AllRead { .. } => ACK_ALL_READ,
            Self::Cleared { .. } => ACK_CLEARED,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::NotificationRead { user_id, .. }
            | Self::AllRead { user_id }
            | Self::Cleared { user_id } => user_id,
        }
    }

    /// Wire payload.
    pub fn payload(&self) -> Value {
        match self {
            Self::NotificationRead { id, user_id } => {
                json!({ "notificationId": id, "userId": user_id })
            }
            Self::AllRead { user_id } | Self::Cleared { user_id } => json!({ "userId": user_id }),
        }
    }
}

/// Everything the transport can tell the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum TransportSignal {
    Connected,
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    ConnectError {
        #[serde(default)]
        message: String,
    },
    Event {
        kind: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Outbound half of a real-time connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to the rooms in `join`. Must be idempotent.
    async fn join(&self, join: &RoomJoin) -> Result<()>;

    /// Send an acknowledgement to the viewer's other sessions.
    async fn emit(&self, event: OutboundEvent) -> Result<()>;
}
