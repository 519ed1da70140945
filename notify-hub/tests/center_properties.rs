//! Invariants of the in-memory notification state under arbitrary
//! operation sequences.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use notify_hub::notification::{
    DefaultComposer, EventEnvelope, IngestOutcome, NotificationCenter, Role, RoutingTable,
    UnreadAggregate, ViewerScope, route_for,
};

const CAPACITY: usize = 8;

#[derive(Debug, Clone)]
enum Op {
    Ingest { kind: usize, event: u8 },
    MarkRead(usize),
    MarkAllRead,
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0usize..4, 0u8..24).prop_map(|(kind, event)| Op::Ingest { kind, event }),
        3 => (0usize..CAPACITY).prop_map(Op::MarkRead),
        1 => Just(Op::MarkAllRead),
        1 => Just(Op::Clear),
    ]
}

fn envelope(kind: usize, event: u8) -> EventEnvelope {
    let event_id = format!("E{event}");
    match kind {
        0 => EventEnvelope::from_parts(
            event_id,
            "order.created",
            json!({ "orderId": "O1", "orderNumber": "1", "branchId": "B1" }),
        ),
        1 => EventEnvelope::from_parts(
            event_id,
            "return.created",
            json!({ "returnId": "R1", "branchId": "B1" }),
        ),
        2 => EventEnvelope::from_parts(
            event_id,
            "sale.created",
            json!({ "saleId": "S1", "branchId": "B1" }),
        ),
        _ => EventEnvelope::from_parts(event_id, "notification.new", json!({ "message": "hi" })),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_center_invariants(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let scope = ViewerScope::new(Role::Branch, "U1").with_branch("B1");
        let mut center = NotificationCenter::new(CAPACITY, Arc::new(RoutingTable::default()));
        center.set_scope(Some(scope.clone()));

        let mut read_ids: HashMap<String, bool> = HashMap::new();

        for op in ops {
            match op {
                Op::Ingest { kind, event } => {
                    let outcome = center.ingest(&envelope(kind, event), &DefaultComposer);
                    if let IngestOutcome::Accepted(notification) = outcome {
                        prop_assert!(!notification.read);
                        let newest = center.notifications()[0].id.clone();
                        prop_assert_eq!(newest, notification.id);
                    }
                }
                Op::MarkRead(index) => {
                    if let Some(id) = center.notifications().get(index).map(|n| n.id.clone()) {
                        prop_assert!(center.mark_read(&id).is_some());
                    }
                }
                Op::MarkAllRead => {
                    center.mark_all_read();
                }
                Op::Clear => {
                    center.clear();
                    read_ids.clear();
                }
            }

            let items = center.notifications();

            // Capacity.
            prop_assert!(items.len() <= CAPACITY);

            // Read monotonicity.
            for notification in &items {
                if read_ids.get(&notification.id).copied().unwrap_or(false) {
                    prop_assert!(notification.read);
                }
                read_ids.insert(notification.id.clone(), notification.read);
            }

            // Aggregate correctness.
            let expected = UnreadAggregate::compute(&items, Some(&scope));
            prop_assert_eq!(center.unread(), &expected);
            let routed = items
                .iter()
                .filter(|n| !n.read && route_for(n.category, scope.role).is_some())
                .count();
            prop_assert_eq!(center.unread().total(), routed);
            prop_assert!(center.unread().total() <= center.unread_count());

            // No two notifications share an event id.
            let mut event_ids: Vec<&str> = items.iter().map(|n| n.event_id.as_str()).collect();
            event_ids.sort_unstable();
            event_ids.dedup();
            prop_assert_eq!(event_ids.len(), items.len());
        }
    }
}
