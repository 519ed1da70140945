//! Notification engine: normalization, routing, lifecycle and badges.

pub mod aggregate;
pub mod center;
pub mod dedup;
pub mod envelope;
pub mod events;
pub mod message;
pub mod model;
mod reconcile;
pub mod routing;
mod service;

pub use aggregate::UnreadAggregate;
pub use center::{IngestOutcome, NotificationCenter};
pub use dedup::{ContentFingerprints, DedupStore};
pub use envelope::{EventEnvelope, ScopeHints, normalize};
pub use events::{ConnectionState, HubEvent, SyncOperation};
pub use message::{DefaultComposer, MessageComposer};
pub use model::{Category, Notification, RelatedIds, Severity};
pub use reconcile::ReconcilerStats;
pub use routing::{Classification, KindRule, Role, RoutingTable, ScopeCheck, ViewerScope, route_for};
pub use service::{BackfillOutcome, NotificationEngine};
