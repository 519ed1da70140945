//! Notification records as held by the lifecycle manager and the remote store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Business area a notification belongs to. Drives the badge route.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Category {
    Orders,
    ProductionTasks,
    Returns,
    Sales,
    #[default]
    Generic,
}

/// Visual severity of a notification.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Success,
    #[default]
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Parse a severity word, tolerating surrounding whitespace and case.
    pub fn parse(value: &str) -> Option<Self> {
        value.trim().parse().ok()
    }
}

/// Identifiers of the domain entities a notification refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chef_id: Option<String>,
}

/// A user-visible notification.
///
/// `read` only ever moves from `false` to `true`; use [`Notification::mark_read`]
/// rather than assigning the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "data")]
    pub related_ids: RelatedIds,
    #[serde(default)]
    pub read: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub event_id: String,
}

impl Notification {
    /// Key used for deduplication. Records from older stores may lack an
    /// event id, in which case the notification id stands in for it.
    pub fn dedup_key(&self) -> &str {
        if self.event_id.is_empty() {
            &self.id
        } else {
            &self.event_id
        }
    }

    /// Flip to read. Returns `true` if the state changed.
    pub fn mark_read(&mut self) -> bool {
        if self.read {
            return false;
        }
        self.read = true;
        true
    }
}

/// Generate a 24-hex-digit identifier in the persistence layer's object id
/// shape: 4 bytes of big-endian unix seconds followed by 8 random bytes.
pub fn new_object_id() -> String {
    let secs = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&secs.to_be_bytes());
    bytes[4..].copy_from_slice(&rand::random::<u64>().to_be_bytes());
    hex::encode(bytes)
}
