//! In-memory notification state for one viewer session.
//!
//! [`NotificationCenter`] is synchronous and owns everything a single
//! mutation must see consistently: the bounded collection, the dedup store
//! and the unread aggregate. The async engine keeps it behind one lock so
//! every operation is a single critical section.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::aggregate::UnreadAggregate;
use super::dedup::{ContentFingerprints, DedupStore};
use super::envelope::EventEnvelope;
use super::message::MessageComposer;
use super::model::{Category, Notification, new_object_id};
use super::routing::{RoutingTable, ViewerScope, category_from_ids};

/// Result of offering an envelope to the center.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted(Notification),
    /// Same event id (or content fingerprint) seen earlier this session.
    Duplicate,
    /// The event does not concern this viewer.
    Irrelevant,
    /// No signed-in viewer, or the viewer's scope is incomplete.
    ScopeUnavailable,
    /// Dropped by the normalizer.
    Malformed(String),
}

impl IngestOutcome {
    pub fn into_notification(self) -> Option<Notification> {
        match self {
            Self::Accepted(notification) => Some(notification),
            _ => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

pub struct NotificationCenter {
    capacity: usize,
    items: VecDeque<Notification>,
    dedup: DedupStore,
    fingerprints: Option<ContentFingerprints>,
    table: Arc<RoutingTable>,
    scope: Option<ViewerScope>,
    unread: UnreadAggregate,
}

impl NotificationCenter {
    pub fn new(capacity: usize, table: Arc<RoutingTable>) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
            dedup: DedupStore::new(),
            fingerprints: None,
            table,
            scope: None,
            unread: UnreadAggregate::default(),
        }
    }

    /// Also collapse id-less deliveries with identical content inside `window`.
    pub fn with_content_dedup(mut self, window: Duration) -> Self {
        self.fingerprints = Some(ContentFingerprints::new(window));
        self
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn scope(&self) -> Option<&ViewerScope> {
        self.scope.as_ref()
    }

    /// Install (or drop) the viewer scope and recompute the aggregate.
    pub fn set_scope(&mut self, scope: Option<ViewerScope>) {
        self.scope = scope;
        self.recompute();
    }

    /// Forget the collection and every dedup record.
    pub fn reset(&mut self) {
        self.items.clear();
        self.dedup.reset();
        if let Some(fingerprints) = &mut self.fingerprints {
            fingerprints.reset();
        }
        self.recompute();
    }

    /// Snapshot of the collection, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.items.iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn unread(&self) -> &UnreadAggregate {
        &self.unread
    }

    /// Dedup, classify and insert one envelope.
    pub fn ingest(&mut self, envelope: &EventEnvelope, composer: &dyn MessageComposer) -> IngestOutcome {
        let Some(scope) = self.scope.as_ref().filter(|s| s.is_complete()) else {
            debug!(event_id = %envelope.event_id, "No viewer scope, dropping event");
            return IngestOutcome::ScopeUnavailable;
        };

        if !self.dedup.accept(&envelope.event_id) {
            debug!(event_id = %envelope.event_id, kind = %envelope.kind, "Duplicate event");
            return IngestOutcome::Duplicate;
        }

        if envelope.id_generated
            && let Some(fingerprints) = &mut self.fingerprints
            && !fingerprints.accept(&envelope.fingerprint())
        {
            debug!(kind = %envelope.kind, "Duplicate event content");
            return IngestOutcome::Duplicate;
        }

        let Some(classification) = self.table.classify(envelope, scope) else {
            debug!(
                event_id = %envelope.event_id,
                kind = %envelope.kind,
                role = %scope.role,
                "Event not relevant to viewer"
            );
            return IngestOutcome::Irrelevant;
        };

        let id = envelope
            .id_field("notificationId")
            .filter(|id| self.get(id).is_none())
            .unwrap_or_else(new_object_id);

        let notification = Notification {
            id,
            category: classification.category,
            severity: classification.severity,
            message: composer.compose(envelope),
            related_ids: envelope.related_ids(),
            read: false,
            created_at: envelope.occurred_at,
            event_id: envelope.event_id.clone(),
        };

        self.items.push_front(notification.clone());
        self.items.truncate(self.capacity);
        self.recompute();

        IngestOutcome::Accepted(notification)
    }

    /// Merge a backfilled batch. Returns how many records were added.
    ///
    /// Records already held in memory win and keep their arrival order.
    /// Repeats inside the batch keep their first occurrence. New records go
    /// behind the live ones, newest `created_at` first, so eviction still
    /// drops them before anything that arrived over the transport.
    pub fn merge_backfill(&mut self, batch: Vec<Notification>) -> usize {
        let mut fresh: Vec<Notification> = Vec::new();

        for mut notification in batch {
            if self.get(&notification.id).is_some() {
                continue;
            }
            if !self.dedup.accept(notification.dedup_key()) {
                continue;
            }
            if notification.category == Category::Generic {
                notification.category = category_from_ids(&notification.related_ids);
            }
            fresh.push(notification);
        }

        let added = fresh.len();
        if added == 0 {
            return 0;
        }

        fresh.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.items.extend(fresh);
        self.items.truncate(self.capacity);
        self.recompute();

        added
    }

    /// Mark one notification read. `None` if it is not in the collection,
    /// otherwise whether its state changed.
    pub fn mark_read(&mut self, id: &str) -> Option<bool> {
        let changed = self.items.iter_mut().find(|n| n.id == id)?.mark_read();
        if changed {
            self.recompute();
        }
        Some(changed)
    }

    /// Mark every notification read. Returns how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        let changed = self
            .items
            .iter_mut()
            .map(Notification::mark_read)
            .filter(|changed| *changed)
            .count();
        if changed > 0 {
            self.recompute();
        }
        changed
    }

    /// Empty the collection and the dedup store together. Returns how many
    /// notifications were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.items.len();
        self.reset();
        removed
    }

    fn recompute(&mut self) {
        self.unread = UnreadAggregate::compute(self.items.make_contiguous(), self.scope.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::message::DefaultComposer;
    use crate::notification::model::{RelatedIds, Severity};
    use crate::notification::routing::Role;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    fn center(capacity: usize, scope: ViewerScope) -> NotificationCenter {
        let mut center = NotificationCenter::new(capacity, Arc::new(RoutingTable::default()));
        center.set_scope(Some(scope));
        center
    }

    fn admin() -> ViewerScope {
        ViewerScope::new(Role::Admin, "U-admin")
    }

    fn sale(event_id: &str) -> EventEnvelope {
        EventEnvelope::from_parts(
            event_id,
            "sale.created",
            json!({ "saleId": format!("S-{event_id}"), "branchId": "B1" }),
        )
    }

    fn stored(id: &str, event_id: &str, minutes_ago: i64, read: bool) -> Notification {
        Notification {
            id: id.to_string(),
            category: Category::Generic,
            severity: Severity::Info,
            message: "stored".to_string(),
            related_ids: RelatedIds {
                order_id: Some("O1".to_string()),
                ..Default::default()
            },
            read,
            created_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
            event_id: event_id.to_string(),
        }
    }

    #[test]
    fn test_ingest_accepts_once() {
        let mut center = center(100, admin());

        let outcome = center.ingest(&sale("E1"), &DefaultComposer);
        let notification = outcome.into_notification().unwrap();
        assert_eq!(notification.category, Category::Sales);
        assert!(!notification.read);
        assert_eq!(notification.id.len(), 24);

        assert_eq!(center.ingest(&sale("E1"), &DefaultComposer), IngestOutcome::Duplicate);
        assert_eq!(center.len(), 1);
        assert_eq!(center.unread().get("/sales"), 1);
    }

    #[test]
    fn test_ingest_without_scope() {
        let mut center = NotificationCenter::new(100, Arc::new(RoutingTable::default()));
        assert_eq!(
            center.ingest(&sale("E1"), &DefaultComposer),
            IngestOutcome::ScopeUnavailable
        );

        center.set_scope(Some(ViewerScope::new(Role::Branch, "U1")));
        assert_eq!(
            center.ingest(&sale("E1"), &DefaultComposer),
            IngestOutcome::ScopeUnavailable
        );
        assert!(center.is_empty());
    }

    #[test]
    fn test_irrelevant_event_is_not_stored() {
        let mut center = center(100, ViewerScope::new(Role::Chef, "U1").with_chef("C1"));
        assert_eq!(center.ingest(&sale("E1"), &DefaultComposer), IngestOutcome::Irrelevant);
        assert!(center.is_empty());
        assert!(center.unread().is_empty());
    }

    #[test]
    fn test_capacity_keeps_newest() {
        let mut center = center(3, admin());
        for i in 0..5 {
            center.ingest(&sale(&format!("E{i}")), &DefaultComposer);
        }

        let ids: Vec<String> = center
            .notifications()
            .into_iter()
            .map(|n| n.event_id)
            .collect();
        assert_eq!(ids, vec!["E4", "E3", "E2"]);
        assert_eq!(center.unread().get("/sales"), 3);
    }

    #[test]
    fn test_persisted_id_is_reused() {
        let mut center = center(100, admin());
        let envelope = EventEnvelope::from_parts(
            "E1",
            "notification.new",
            json!({ "message": "hello", "notificationId": "65a1b2c3d4e5f60718293a4b" }),
        );
        let notification = center.ingest(&envelope, &DefaultComposer).into_notification().unwrap();
        assert_eq!(notification.id, "65a1b2c3d4e5f60718293a4b");
    }

    #[test]
    fn test_notification_ids_are_unique() {
        let mut center = center(100, admin());
        let created = EventEnvelope::from_parts(
            "E1",
            "order.created",
            json!({ "orderId": "O1", "orderNumber": "1", "branchId": "B1", "_id": "65a1b2c3d4e5f60718293a4b" }),
        );
        let changed = EventEnvelope::from_parts(
            "E2",
            "order.statusChanged",
            json!({ "orderId": "O1", "status": "delivered", "_id": "65a1b2c3d4e5f60718293a4b" }),
        );
        let a = center.ingest(&created, &DefaultComposer).into_notification().unwrap();
        let b = center.ingest(&changed, &DefaultComposer).into_notification().unwrap();
        assert_ne!(a.id, "65a1b2c3d4e5f60718293a4b");
        assert_ne!(a.id, b.id);

        // A repeated notificationId on a different event gets a fresh id.
        let first = EventEnvelope::from_parts(
            "E3",
            "notification.new",
            json!({ "message": "one", "notificationId": "65a1b2c3d4e5f60718293a4c" }),
        );
        let second = EventEnvelope::from_parts(
            "E4",
            "notification.new",
            json!({ "message": "two", "notificationId": "65a1b2c3d4e5f60718293a4c" }),
        );
        let c = center.ingest(&first, &DefaultComposer).into_notification().unwrap();
        let d = center.ingest(&second, &DefaultComposer).into_notification().unwrap();
        assert_eq!(c.id, "65a1b2c3d4e5f60718293a4c");
        assert_ne!(d.id, c.id);

        assert_eq!(center.mark_read(&a.id), Some(true));
        assert_eq!(center.unread().get("/orders"), 1);
        assert_eq!(center.unread_count(), 3);
    }

    #[test]
    fn test_merge_backfill_keeps_arrival_order() {
        let mut center = center(2, admin());
        let mut older = sale("A");
        older.occurred_at = Utc::now() - ChronoDuration::minutes(1);
        let mut oldest = sale("B");
        oldest.occurred_at = Utc::now() - ChronoDuration::minutes(10);

        center.ingest(&older, &DefaultComposer);
        center.ingest(&oldest, &DefaultComposer);
        let event_ids = |center: &NotificationCenter| -> Vec<String> {
            center.notifications().into_iter().map(|n| n.event_id).collect()
        };
        assert_eq!(event_ids(&center), vec!["B", "A"]);

        assert_eq!(center.merge_backfill(Vec::new()), 0);
        assert_eq!(event_ids(&center), vec!["B", "A"]);

        // Backfilled records never displace live arrivals.
        let batch = vec![stored("000000000000000000000009", "E9", 0, false)];
        assert_eq!(center.merge_backfill(batch), 1);
        assert_eq!(event_ids(&center), vec!["B", "A"]);

        center.ingest(&sale("C"), &DefaultComposer);
        assert_eq!(event_ids(&center), vec!["C", "B"]);
    }

    #[test]
    fn test_content_dedup_only_for_generated_ids() {
        let mut center = NotificationCenter::new(100, Arc::new(RoutingTable::default()))
            .with_content_dedup(Duration::from_secs(60));
        center.set_scope(Some(admin()));

        let mut first = sale("gen-1");
        first.id_generated = true;
        let mut second = sale("gen-2");
        second.payload = first.payload.clone();
        second.id_generated = true;

        assert!(center.ingest(&first, &DefaultComposer).is_accepted());
        assert_eq!(center.ingest(&second, &DefaultComposer), IngestOutcome::Duplicate);

        let mut explicit = sale("E9");
        explicit.payload = first.payload.clone();
        assert!(center.ingest(&explicit, &DefaultComposer).is_accepted());
    }

    #[test]
    fn test_merge_backfill_keeps_memory_state() {
        let mut center = center(100, admin());
        let live = center.ingest(&sale("E1"), &DefaultComposer).into_notification().unwrap();

        let mut stale = live.clone();
        stale.read = true;
        let batch = vec![
            stale,
            stored("000000000000000000000002", "E2", 5, false),
            stored("000000000000000000000003", "E2", 6, false),
            stored("000000000000000000000004", "E4", 10, true),
        ];

        assert_eq!(center.merge_backfill(batch), 2);
        let items = center.notifications();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].id, live.id);
        assert!(!items[0].read);
        assert_eq!(items[1].id, "000000000000000000000002");
        assert_eq!(items[1].category, Category::Orders);
        assert_eq!(items[2].id, "000000000000000000000004");
        assert_eq!(center.unread().get("/orders"), 1);
        assert_eq!(center.unread().get("/sales"), 1);
    }

    #[test]
    fn test_merge_backfill_respects_capacity() {
        let mut center = center(2, admin());
        let batch = (0..4)
            .map(|i| stored(&format!("{:024}", i), &format!("E{i}"), i, false))
            .collect();

        assert_eq!(center.merge_backfill(batch), 4);
        let ids: Vec<String> = center.notifications().into_iter().map(|n| n.event_id).collect();
        assert_eq!(ids, vec!["E0", "E1"]);
    }

    #[test]
    fn test_mark_read_and_mark_all() {
        let mut center = center(100, admin());
        let first = center.ingest(&sale("E1"), &DefaultComposer).into_notification().unwrap();
        center.ingest(&sale("E2"), &DefaultComposer);

        assert_eq!(center.mark_read(&first.id), Some(true));
        assert_eq!(center.mark_read(&first.id), Some(false));
        assert_eq!(center.mark_read("000000000000000000000000"), None);
        assert_eq!(center.unread().get("/sales"), 1);

        assert_eq!(center.mark_all_read(), 1);
        assert_eq!(center.mark_all_read(), 0);
        assert!(center.unread().is_empty());
        assert_eq!(center.unread_count(), 0);
    }

    #[test]
    fn test_clear_resets_dedup() {
        let mut center = center(100, admin());
        center.ingest(&sale("E1"), &DefaultComposer);

        assert_eq!(center.clear(), 1);
        assert!(center.is_empty());
        assert!(center.ingest(&sale("E1"), &DefaultComposer).is_accepted());
    }

    #[test]
    fn test_scope_change_recomputes_routes() {
        let mut center = center(100, admin());
        center.ingest(&sale("E1"), &DefaultComposer);
        assert_eq!(center.unread().get("/sales"), 1);

        center.set_scope(Some(ViewerScope::new(Role::Branch, "U1").with_branch("B1")));
        assert_eq!(center.unread().get("/sales"), 0);
        assert_eq!(center.unread().get("/branch-sales"), 1);

        center.set_scope(None);
        assert!(center.unread().is_empty());
    }
}
