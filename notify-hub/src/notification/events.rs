//! Facts published by the engine for side-effect consumers.
//!
//! Toasts, sounds and badges are not the engine's business. It only
//! broadcasts what happened; a dispatcher subscribed to the channel decides
//! how to present it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{Category, Notification, Severity};

/// Transport event kind acknowledging a single read, in both directions.
pub const ACK_NOTIFICATION_READ: &str = "notification.read";
/// Transport event kind acknowledging mark-all-read.
pub const ACK_ALL_READ: &str = "notifications.allRead";
/// Transport event kind acknowledging a clear.
pub const ACK_CLEARED: &str = "notifications.cleared";

/// Remote operation a sync failure belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncOperation {
    MarkRead,
    MarkAllRead,
    Clear,
    Backfill,
    Join,
}

/// Connection state reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "state", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected { reason: String },
    Failed { message: String },
}

/// What happened inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A new notification entered the collection.
    Accepted {
        notification: Notification,
        /// Badge route the notification feeds, if any.
        route: Option<String>,
    },
    Read {
        id: String,
        /// Acknowledged by another session of the same viewer.
        remote: bool,
    },
    AllRead {
        count: usize,
        remote: bool,
    },
    Cleared {
        count: usize,
        remote: bool,
    },
    BackfillMerged {
        fetched: usize,
        added: usize,
    },
    SyncFailed {
        operation: SyncOperation,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Connection(ConnectionState),
}

impl HubEvent {
    pub fn sync_failed(operation: SyncOperation, message: impl Into<String>) -> Self {
        Self::SyncFailed {
            operation,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Short machine-readable name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Read { .. } => "read",
            Self::AllRead { .. } => "all_read",
            Self::Cleared { .. } => "cleared",
            Self::BackfillMerged { .. } => "backfill_merged",
            Self::SyncFailed { .. } => "sync_failed",
            Self::Connection(_) => "connection",
        }
    }

    /// Severity to present, for events that have one.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Self::Accepted { notification, .. } => Some(notification.severity),
            Self::SyncFailed { .. } => Some(Severity::Error),
            Self::Connection(ConnectionState::Failed { .. }) => Some(Severity::Warning),
            _ => None,
        }
    }

    /// Category of an accepted notification.
    pub fn category(&self) -> Option<Category> {
        match self {
            Self::Accepted { notification, .. } => Some(notification.category),
            _ => None,
        }
    }
}
