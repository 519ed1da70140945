//! Persistent notification store seam.
//!
//! The remote store is the source of truth across sessions; the engine only
//! pulls from it on (re)connect and pushes read/clear changes to it.

mod http;
mod memory;

pub use http::HttpNotificationStore;
pub use memory::MemoryNotificationStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::notification::model::Notification;
use crate::notification::routing::ViewerScope;

/// Query for a backfill fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchParams {
    pub user_id: String,
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chef_id: Option<String>,
}

impl FetchParams {
    pub fn from_scope(scope: &ViewerScope, limit: usize) -> Self {
        Self {
            user_id: scope.user_id.clone(),
            limit,
            branch_id: scope.branch_id.clone(),
            department_id: scope.department_id.clone(),
            chef_id: scope.chef_id.clone(),
        }
    }

    /// Query string pairs, in a stable order.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("userId", self.user_id.clone()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(id) = &self.branch_id {
            pairs.push(("branchId", id.clone()));
        }
        if let Some(id) = &self.department_id {
            pairs.push(("departmentId", id.clone()));
        }
        if let Some(id) = &self.chef_id {
            pairs.push(("chefId", id.clone()));
        }
        pairs
    }
}

/// Remote notification persistence.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Recent notifications for the viewer, newest first.
    async fn fetch(&self, params: &FetchParams) -> Result<Vec<Notification>>;

    async fn mark_as_read(&self, id: &str) -> Result<()>;

    async fn mark_all_as_read(&self, user_id: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}
