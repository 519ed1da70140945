//! Process-local notification store.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{FetchParams, NotificationStore};
use crate::Result;
use crate::notification::model::Notification;

/// Keeps notifications in memory. Used when no remote store is configured.
#[derive(Default)]
pub struct MemoryNotificationStore {
    items: Mutex<Vec<Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<Notification>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    pub fn insert(&self, notification: Notification) {
        self.items.lock().push(notification);
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.items.lock().clone()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn fetch(&self, params: &FetchParams) -> Result<Vec<Notification>> {
        let mut items = self.items.lock().clone();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(params.limit);
        Ok(items)
    }

    async fn mark_as_read(&self, id: &str) -> Result<()> {
        if let Some(notification) = self.items.lock().iter_mut().find(|n| n.id == id) {
            notification.mark_read();
        }
        Ok(())
    }

    async fn mark_all_as_read(&self, _user_id: &str) -> Result<()> {
        for notification in self.items.lock().iter_mut() {
            notification.mark_read();
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.items.lock().clear();
        Ok(())
    }
}
