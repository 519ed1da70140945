//! Unread counts per destination route.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::model::Notification;
use super::routing::{ViewerScope, route_for};

/// Unread notification counts keyed by UI route.
///
/// Always a pure function of the unread notifications and the viewer scope;
/// it is recomputed from scratch rather than patched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnreadAggregate {
    counts: BTreeMap<String, usize>,
}

impl UnreadAggregate {
    /// Count unread notifications by route. Without a scope nothing routes.
    pub fn compute(items: &[Notification], scope: Option<&ViewerScope>) -> Self {
        let mut counts = BTreeMap::new();
        let Some(scope) = scope else {
            return Self { counts };
        };

        for notification in items.iter().filter(|n| !n.read) {
            if let Some(route) = route_for(notification.category, scope.role) {
                *counts.entry(route.to_string()).or_insert(0) += 1;
            }
        }

        Self { counts }
    }

    /// Count for `route`, zero when absent.
    pub fn get(&self, route: &str) -> usize {
        self.counts.get(route).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.counts.iter().map(|(route, count)| (route.as_str(), *count))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::model::{Category, RelatedIds, Severity};
    use crate::notification::routing::Role;
    use chrono::Utc;
    use proptest::prelude::*;

    fn notification(id: usize, category: Category, read: bool) -> Notification {
        Notification {
            id: format!("{:024x}", id),
            category,
            severity: Severity::Info,
            message: String::new(),
            related_ids: RelatedIds::default(),
            read,
            created_at: Utc::now(),
            event_id: format!("E{}", id),
        }
    }

    #[test]
    fn test_compute_by_role() {
        let items = vec![
            notification(1, Category::Orders, false),
            notification(2, Category::Orders, true),
            notification(3, Category::Returns, false),
            notification(4, Category::Generic, false),
            notification(5, Category::ProductionTasks, false),
        ];

        let branch = ViewerScope::new(Role::Branch, "U1").with_branch("B1");
        let aggregate = UnreadAggregate::compute(&items, Some(&branch));
        assert_eq!(aggregate.get("/branch-orders"), 1);
        assert_eq!(aggregate.get("/branch-returns"), 1);
        assert_eq!(aggregate.get("/production-tasks"), 1);
        assert_eq!(aggregate.get("/orders"), 0);
        assert_eq!(aggregate.total(), 3);

        let chef = ViewerScope::new(Role::Chef, "U2").with_chef("C1");
        let aggregate = UnreadAggregate::compute(&items, Some(&chef));
        assert_eq!(aggregate.get("/chef-tasks"), 1);
        assert_eq!(aggregate.get("/orders"), 1);
    }

    #[test]
    fn test_compute_without_scope_is_empty() {
        let items = vec![notification(1, Category::Orders, false)];
        assert!(UnreadAggregate::compute(&items, None).is_empty());
    }

    #[test]
    fn test_serializes_as_map() {
        let items = vec![notification(1, Category::Sales, false)];
        let admin = ViewerScope::new(Role::Admin, "U1");
        let value = serde_json::to_value(UnreadAggregate::compute(&items, Some(&admin))).unwrap();
        assert_eq!(value, serde_json::json!({ "/sales": 1 }));
    }

    fn category_strategy() -> impl Strategy<Value = Category> {
        prop_oneof![
            Just(Category::Orders),
            Just(Category::ProductionTasks),
            Just(Category::Returns),
            Just(Category::Sales),
            Just(Category::Generic),
        ]
    }

    fn role_strategy() -> impl Strategy<Value = Role> {
        prop_oneof![
            Just(Role::Admin),
            Just(Role::Branch),
            Just(Role::Production),
            Just(Role::Chef),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_aggregate_matches_unread_routes(
            entries in prop::collection::vec((category_strategy(), any::<bool>()), 0..60),
            role in role_strategy(),
        ) {
            let items: Vec<Notification> = entries
                .iter()
                .enumerate()
                .map(|(i, (category, read))| notification(i, *category, *read))
                .collect();
            let scope = ViewerScope::new(role, "U1");
            let aggregate = UnreadAggregate::compute(&items, Some(&scope));

            let unread = items.iter().filter(|n| !n.read).count();
            let routed = items
                .iter()
                .filter(|n| !n.read && route_for(n.category, role).is_some())
                .count();
            prop_assert_eq!(aggregate.total(), routed);
            prop_assert!(aggregate.total() <= unread);

            for (route, count) in aggregate.iter() {
                let expected = items
                    .iter()
                    .filter(|n| !n.read && route_for(n.category, role) == Some(route))
                    .count();
                prop_assert_eq!(count, expected);
                prop_assert!(count > 0);
            }
        }
    }
}
