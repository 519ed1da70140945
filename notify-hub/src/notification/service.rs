//! Notification engine.
//!
//! The `NotificationEngine` is responsible for:
//! - Turning transport signals into accepted notifications (normalize,
//!   dedup, classify, insert)
//! - The read/unread lifecycle, with remote sync in detached tasks
//! - Backfilling from the remote store, debounced
//! - Publishing unread badges and hub facts to consumers

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::aggregate::UnreadAggregate;
use super::center::{IngestOutcome, NotificationCenter};
use super::envelope::{EventEnvelope, normalize};
use super::events::{ACK_ALL_READ, ACK_CLEARED, ACK_NOTIFICATION_READ, HubEvent, SyncOperation};
use super::message::{DefaultComposer, MessageComposer};
use super::model::Notification;
use super::reconcile::ReconcilerState;
use super::routing::{RoutingTable, ViewerScope, route_for};
use crate::config::HubConfig;
use crate::store::{FetchParams, NotificationStore};
use crate::transport::{OutboundEvent, Transport, TransportSignal};
use crate::{Error, Result};

/// Result of a backfill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackfillOutcome {
    Merged { fetched: usize, added: usize },
    /// Another backfill was running or one started too recently.
    Skipped,
    /// The viewer changed, or the collection was cleared, while the fetch
    /// was in flight; the batch was dropped.
    Stale,
}

#[derive(Debug, Default)]
struct GateState {
    in_flight: bool,
    last_started: Option<Instant>,
}

/// Admits at most one backfill at a time, spaced by a minimum interval.
struct BackfillGate {
    min_spacing: Duration,
    state: Mutex<GateState>,
}

impl BackfillGate {
    fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            state: Mutex::new(GateState::default()),
        }
    }

    fn try_acquire(&self) -> Option<BackfillPermit<'_>> {
        let mut state = self.state.lock();
        if state.in_flight {
            return None;
        }
        let now = Instant::now();
        if let Some(last) = state.last_started
            && now.duration_since(last) < self.min_spacing
        {
            return None;
        }
        state.in_flight = true;
        state.last_started = Some(now);
        Some(BackfillPermit { gate: self })
    }
}

struct BackfillPermit<'a> {
    gate: &'a BackfillGate,
}

impl Drop for BackfillPermit<'_> {
    fn drop(&mut self) {
        self.gate.state.lock().in_flight = false;
    }
}

/// The notification engine for one viewer.
pub struct NotificationEngine {
    config: HubConfig,
    center: Mutex<NotificationCenter>,
    store: Arc<dyn NotificationStore>,
    pub(super) transport: Arc<dyn Transport>,
    composer: Arc<dyn MessageComposer>,
    id_pattern: Regex,
    backfill_gate: BackfillGate,
    /// Bumped whenever an in-flight backfill must not be merged: sign-in,
    /// sign-out, scope change and clear.
    session: AtomicU64,
    event_tx: broadcast::Sender<HubEvent>,
    unread_tx: watch::Sender<UnreadAggregate>,
    sync_tasks: TaskTracker,
    cancellation_token: CancellationToken,
    pub(super) reconciler: ReconcilerState,
}

impl NotificationEngine {
    /// Create an engine with the built-in routing table and message composer.
    pub fn new(
        config: HubConfig,
        store: Arc<dyn NotificationStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let id_pattern = config.id_regex()?;
        let (event_tx, _) = broadcast::channel(config.event_buffer);
        let (unread_tx, _) = watch::channel(UnreadAggregate::default());

        Ok(Self {
            center: Mutex::new(Self::build_center(&config, Arc::new(RoutingTable::default()))),
            backfill_gate: BackfillGate::new(config.backfill_debounce()),
            config,
            store,
            transport,
            composer: Arc::new(DefaultComposer),
            id_pattern,
            session: AtomicU64::new(0),
            event_tx,
            unread_tx,
            sync_tasks: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
            reconciler: ReconcilerState::default(),
        })
    }

    /// Replace the routing table. Resets all session state.
    pub fn with_routing_table(self, table: RoutingTable) -> Self {
        *self.center.lock() = Self::build_center(&self.config, Arc::new(table));
        self
    }

    pub fn with_composer(mut self, composer: Arc<dyn MessageComposer>) -> Self {
        self.composer = composer;
        self
    }

    fn build_center(config: &HubConfig, table: Arc<RoutingTable>) -> NotificationCenter {
        let center = NotificationCenter::new(config.capacity, table);
        match config.content_dedup_window() {
            Some(window) => center.with_content_dedup(window),
            None => center,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        Arc::clone(self.center.lock().table())
    }

    // ---- Sessions ----

    /// Install the viewer and start a fresh session.
    pub fn sign_in(&self, scope: ViewerScope) -> Result<()> {
        if let Some(missing) = scope.missing_identifier() {
            return Err(Error::ScopeUnavailable(format!(
                "{} scope is missing {}",
                scope.role, missing
            )));
        }

        let mut center = self.center.lock();
        center.reset();
        info!(user_id = %scope.user_id, role = %scope.role, "Viewer signed in");
        center.set_scope(Some(scope));
        self.session.fetch_add(1, Ordering::SeqCst);
        self.publish_unread(&center);
        Ok(())
    }

    /// Drop the viewer together with the collection and dedup store.
    pub fn sign_out(&self) {
        let mut center = self.center.lock();
        center.reset();
        center.set_scope(None);
        self.session.fetch_add(1, Ordering::SeqCst);
        self.publish_unread(&center);
        info!("Viewer signed out");
    }

    /// Switch the viewer's scope in place.
    ///
    /// For the same user (a role or branch switch) the collection is kept and
    /// only the unread aggregate is recomputed. A different user starts a
    /// fresh session, as [`Self::sign_in`] does.
    pub fn set_scope(&self, scope: ViewerScope) -> Result<()> {
        if let Some(missing) = scope.missing_identifier() {
            return Err(Error::ScopeUnavailable(format!(
                "{} scope is missing {}",
                scope.role, missing
            )));
        }

        let mut center = self.center.lock();
        let same_user = center
            .scope()
            .is_some_and(|current| current.user_id == scope.user_id);
        if !same_user {
            center.reset();
        }
        info!(user_id = %scope.user_id, role = %scope.role, same_user, "Viewer scope changed");
        center.set_scope(Some(scope));
        self.session.fetch_add(1, Ordering::SeqCst);
        self.publish_unread(&center);
        Ok(())
    }

    pub fn scope(&self) -> Option<ViewerScope> {
        self.center.lock().scope().cloned()
    }

    /// The signed-in scope, if it is complete enough to act on.
    pub(super) fn require_scope(&self) -> Result<ViewerScope> {
        let scope = self
            .scope()
            .ok_or_else(|| Error::ScopeUnavailable("no viewer signed in".to_string()))?;
        if let Some(missing) = scope.missing_identifier() {
            return Err(Error::ScopeUnavailable(format!(
                "{} scope is missing {}",
                scope.role, missing
            )));
        }
        Ok(scope)
    }

    // ---- Inbound ----

    /// Offer an already-normalized envelope.
    pub fn ingest(&self, envelope: &EventEnvelope) -> IngestOutcome {
        let mut center = self.center.lock();
        let outcome = center.ingest(envelope, self.composer.as_ref());

        if let IngestOutcome::Accepted(notification) = &outcome {
            let route = center
                .scope()
                .and_then(|scope| route_for(notification.category, scope.role));
            debug!(
                event_id = %envelope.event_id,
                kind = %envelope.kind,
                category = %notification.category,
                route = ?route,
                "Notification accepted"
            );
            self.publish_unread(&center);
            self.publish(HubEvent::Accepted {
                notification: notification.clone(),
                route: route.map(str::to_string),
            });
        }

        outcome
    }

    /// Normalize and offer a raw transport payload.
    pub fn ingest_raw(&self, kind: &str, raw: Value) -> IngestOutcome {
        let table = self.routing_table();
        match normalize(kind, raw, &table) {
            Ok(envelope) => self.ingest(&envelope),
            Err(e) => IngestOutcome::Malformed(e.to_string()),
        }
    }

    /// Dispatch one transport signal. Event signals return their outcome.
    pub async fn handle_signal(&self, signal: TransportSignal) -> Option<IngestOutcome> {
        match signal {
            TransportSignal::Connected => {
                if let Err(e) = self.handle_connect().await {
                    warn!("Reconnect not reconciled: {}", e);
                }
                None
            }
            TransportSignal::Disconnected { reason } => {
                self.handle_disconnect(&reason);
                None
            }
            TransportSignal::ConnectError { message } => {
                self.handle_connect_error(&message);
                None
            }
            TransportSignal::Event { kind, payload } => match kind.as_str() {
                ACK_NOTIFICATION_READ | ACK_ALL_READ | ACK_CLEARED => {
                    self.handle_ack(&kind, &payload);
                    None
                }
                _ => Some(self.ingest_raw(&kind, payload)),
            },
        }
    }

    /// Apply a read/clear acknowledgement from another session of this viewer.
    fn handle_ack(&self, kind: &str, payload: &Value) {
        let Some(scope) = self.scope() else {
            debug!(kind, "Ignoring acknowledgement without a viewer");
            return;
        };
        if let Some(user_id) = payload.get("userId").and_then(Value::as_str)
            && user_id != scope.user_id
        {
            debug!(kind, user_id, "Ignoring acknowledgement for another viewer");
            return;
        }

        match kind {
            ACK_NOTIFICATION_READ => {
                let id = ["notificationId", "id", "_id"]
                    .iter()
                    .find_map(|key| payload.get(*key).and_then(Value::as_str));
                match id {
                    Some(id) => self.apply_remote_read(id),
                    None => debug!("Read acknowledgement without an id"),
                }
            }
            ACK_ALL_READ => self.apply_remote_all_read(),
            _ => self.apply_remote_clear(),
        }
    }

    /// Mark read locally on behalf of another session, without re-emitting.
    pub fn apply_remote_read(&self, id: &str) {
        let mut center = self.center.lock();
        if center.mark_read(id) == Some(true) {
            self.publish_unread(&center);
            self.publish(HubEvent::Read {
                id: id.to_string(),
                remote: true,
            });
        }
    }

    pub fn apply_remote_all_read(&self) {
        let mut center = self.center.lock();
        let count = center.mark_all_read();
        if count > 0 {
            self.publish_unread(&center);
            self.publish(HubEvent::AllRead {
                count,
                remote: true,
            });
        }
    }

    pub fn apply_remote_clear(&self) {
        let mut center = self.center.lock();
        let count = center.clear();
        self.session.fetch_add(1, Ordering::SeqCst);
        self.publish_unread(&center);
        self.publish(HubEvent::Cleared {
            count,
            remote: true,
        });
    }

    // ---- Lifecycle ----

    /// Mark one notification read.
    ///
    /// The id must match the configured identifier shape; otherwise nothing
    /// changes. The local flip is immediate; the store update and the
    /// acknowledgement run detached and report failures as
    /// [`HubEvent::SyncFailed`] without rolling back. Must be called from
    /// within a Tokio runtime.
    pub fn mark_read(&self, id: &str) -> Result<()> {
        if !self.id_pattern.is_match(id) {
            warn!(id, "Refusing to mark read: invalid notification id");
            return Err(Error::InvalidIdentifier(id.to_string()));
        }
        let scope = self.require_scope()?;

        let changed = {
            let mut center = self.center.lock();
            let changed = center.mark_read(id);
            if changed == Some(true) {
                self.publish_unread(&center);
            }
            changed
        };

        match changed {
            Some(false) => {
                debug!(id, "Notification already read");
                return Ok(());
            }
            Some(true) => self.publish(HubEvent::Read {
                id: id.to_string(),
                remote: false,
            }),
            None => debug!(id, "Notification not held locally, syncing anyway"),
        }

        self.spawn_sync(
            SyncOperation::MarkRead,
            OutboundEvent::NotificationRead {
                id: id.to_string(),
                user_id: scope.user_id,
            },
        );
        Ok(())
    }

    /// Mark everything read. Returns how many local notifications changed.
    pub fn mark_all_read(&self) -> Result<usize> {
        let scope = self.require_scope()?;

        let count = {
            let mut center = self.center.lock();
            let count = center.mark_all_read();
            self.publish_unread(&center);
            count
        };
        self.publish(HubEvent::AllRead {
            count,
            remote: false,
        });

        self.spawn_sync(
            SyncOperation::MarkAllRead,
            OutboundEvent::AllRead {
                user_id: scope.user_id,
            },
        );
        Ok(count)
    }

    /// Empty the collection and the dedup store. Returns how many
    /// notifications were removed.
    pub fn clear(&self) -> Result<usize> {
        let scope = self.require_scope()?;

        let count = {
            let mut center = self.center.lock();
            let count = center.clear();
            self.session.fetch_add(1, Ordering::SeqCst);
            self.publish_unread(&center);
            count
        };
        info!(count, "Notifications cleared");
        self.publish(HubEvent::Cleared {
            count,
            remote: false,
        });

        self.spawn_sync(
            SyncOperation::Clear,
            OutboundEvent::Cleared {
                user_id: scope.user_id,
            },
        );
        Ok(count)
    }

    /// Push a local change to the store and the viewer's other sessions.
    fn spawn_sync(&self, operation: SyncOperation, outbound: OutboundEvent) {
        let store = Arc::clone(&self.store);
        let transport = Arc::clone(&self.transport);
        let event_tx = self.event_tx.clone();

        self.sync_tasks.spawn(async move {
            let result = match &outbound {
                OutboundEvent::NotificationRead { id, .. } => store.mark_as_read(id).await,
                OutboundEvent::AllRead { user_id } => store.mark_all_as_read(user_id).await,
                OutboundEvent::Cleared { .. } => store.clear().await,
            };
            if let Err(e) = result {
                warn!(operation = %operation, "Notification store sync failed: {}", e);
                let _ = event_tx.send(HubEvent::sync_failed(operation, e.to_string()));
            }

            if let Err(e) = transport.emit(outbound).await {
                warn!(operation = %operation, "Failed to emit acknowledgement: {}", e);
                let _ = event_tx.send(HubEvent::sync_failed(operation, e.to_string()));
            }
        });
    }

    /// Wait until every sync task spawned so far has finished.
    pub async fn flush_sync(&self) {
        self.sync_tasks.close();
        self.sync_tasks.wait().await;
        self.sync_tasks.reopen();
    }

    // ---- Backfill ----

    /// Pull recent notifications from the store and merge them.
    ///
    /// Debounced: while one backfill runs, or within the configured spacing
    /// of the previous start, this returns [`BackfillOutcome::Skipped`].
    pub async fn backfill(&self) -> Result<BackfillOutcome> {
        let scope = self.require_scope()?;

        let Some(_permit) = self.backfill_gate.try_acquire() else {
            debug!("Backfill skipped by debounce");
            return Ok(BackfillOutcome::Skipped);
        };

        let session = self.session.load(Ordering::SeqCst);
        let params = FetchParams::from_scope(&scope, self.config.backfill_limit);

        let batch = match self.store.fetch(&params).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(user_id = %scope.user_id, "Backfill failed: {}", e);
                self.publish(HubEvent::sync_failed(SyncOperation::Backfill, e.to_string()));
                return Err(Error::remote_sync(SyncOperation::Backfill.to_string(), e.to_string()));
            }
        };

        let fetched = batch.len();
        let added = {
            let mut center = self.center.lock();
            // Checked under the lock so a clear cannot slip in before the merge.
            if self.session.load(Ordering::SeqCst) != session {
                debug!("Viewer changed or cleared during backfill, dropping batch");
                return Ok(BackfillOutcome::Stale);
            }
            let added = center.merge_backfill(batch);
            self.publish_unread(&center);
            added
        };

        info!(fetched, added, "Backfill merged");
        self.publish(HubEvent::BackfillMerged { fetched, added });
        Ok(BackfillOutcome::Merged { fetched, added })
    }

    // ---- Consumers ----

    /// Snapshot of the collection, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.center.lock().notifications()
    }

    pub fn unread(&self) -> UnreadAggregate {
        self.center.lock().unread().clone()
    }

    pub fn unread_count(&self) -> usize {
        self.center.lock().unread_count()
    }

    /// Hub facts for side-effect dispatchers.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.event_tx.subscribe()
    }

    /// Live unread badges.
    pub fn subscribe_unread(&self) -> watch::Receiver<UnreadAggregate> {
        self.unread_tx.subscribe()
    }

    pub(super) fn publish(&self, event: HubEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn publish_unread(&self, center: &NotificationCenter) {
        self.unread_tx.send_if_modified(|current| {
            if current == center.unread() {
                return false;
            }
            *current = center.unread().clone();
            true
        });
    }

    // ---- Run loop ----

    /// Consume transport signals until stopped or the channel closes.
    pub fn start(self: &Arc<Self>, mut rx: broadcast::Receiver<TransportSignal>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Transport listener shutting down");
                        break;
                    }
                    result = rx.recv() => {
                        match result {
                            Ok(signal) => {
                                engine.handle_signal(signal).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Transport listener lagged by {} signals, backfilling", n);
                                if let Err(e) = engine.backfill().await {
                                    warn!("Backfill after lag failed: {}", e);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Transport channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Stop listening and wait for outstanding sync tasks.
    pub async fn stop(&self) {
        info!("Stopping notification engine");
        self.cancellation_token.cancel();
        self.flush_sync().await;
        info!("Notification engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::model::Category;
    use crate::notification::routing::Role;
    use crate::transport::LocalBus;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct MockStore {
        items: tokio::sync::Mutex<Vec<Notification>>,
        read_calls: tokio::sync::Mutex<Vec<String>>,
        fetch_calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                items: tokio::sync::Mutex::new(Vec::new()),
                read_calls: tokio::sync::Mutex::new(Vec::new()),
                fetch_calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }

        fn check(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::remote_sync("mock", "503 Service Unavailable"));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl NotificationStore for MockStore {
        async fn fetch(&self, _params: &FetchParams) -> Result<Vec<Notification>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            Ok(self.items.lock().await.clone())
        }

        async fn mark_as_read(&self, id: &str) -> Result<()> {
            self.read_calls.lock().await.push(id.to_string());
            self.check()
        }

        async fn mark_all_as_read(&self, _user_id: &str) -> Result<()> {
            self.check()
        }

        async fn clear(&self) -> Result<()> {
            self.check()
        }
    }

    fn config() -> HubConfig {
        HubConfig {
            backfill_debounce_ms: 0,
            ..Default::default()
        }
    }

    fn engine_with(store: Arc<MockStore>, config: HubConfig) -> NotificationEngine {
        let bus = LocalBus::default();
        NotificationEngine::new(config, store, Arc::new(bus.session())).unwrap()
    }

    fn admin() -> ViewerScope {
        ViewerScope::new(Role::Admin, "U-admin")
    }

    fn sale_payload(event_id: &str) -> Value {
        json!({ "eventId": event_id, "saleId": "S1", "branchId": "B1" })
    }

    #[tokio::test]
    async fn test_ingest_without_sign_in() {
        let engine = engine_with(Arc::new(MockStore::new()), config());
        assert_eq!(
            engine.ingest_raw("sale.created", sale_payload("E1")),
            IngestOutcome::ScopeUnavailable
        );
    }

    #[tokio::test]
    async fn test_sign_in_rejects_incomplete_scope() {
        let engine = engine_with(Arc::new(MockStore::new()), config());
        let err = engine
            .sign_in(ViewerScope::new(Role::Production, "U1"))
            .unwrap_err();
        assert!(matches!(err, Error::ScopeUnavailable(_)));
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let engine = engine_with(Arc::new(MockStore::new()), config());
        engine.sign_in(admin()).unwrap();

        let outcome = engine.ingest_raw("sale.created", json!({ "eventId": "E1" }));
        assert!(matches!(outcome, IngestOutcome::Malformed(_)));
        assert!(engine.notifications().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_event_is_published() {
        let engine = engine_with(Arc::new(MockStore::new()), config());
        engine.sign_in(admin()).unwrap();
        let mut events = engine.subscribe();
        let mut unread = engine.subscribe_unread();

        assert!(engine.ingest_raw("saleCreated", sale_payload("E1")).is_accepted());

        match events.recv().await.unwrap() {
            HubEvent::Accepted { notification, route } => {
                assert_eq!(notification.category, Category::Sales);
                assert_eq!(route.as_deref(), Some("/sales"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(unread.has_changed().unwrap());
        assert_eq!(unread.borrow_and_update().get("/sales"), 1);
    }

    #[tokio::test]
    async fn test_mark_read_syncs_in_background() {
        let store = Arc::new(MockStore::new());
        let engine = engine_with(Arc::clone(&store), config());
        engine.sign_in(admin()).unwrap();
        let id = engine
            .ingest_raw("sale.created", sale_payload("E1"))
            .into_notification()
            .unwrap()
            .id;

        engine.mark_read(&id).unwrap();
        assert_eq!(engine.unread_count(), 0);

        engine.flush_sync().await;
        assert_eq!(*store.read_calls.lock().await, vec![id.clone()]);

        // Already read: nothing to sync.
        engine.mark_read(&id).unwrap();
        engine.flush_sync().await;
        assert_eq!(store.read_calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_failure_keeps_local_state() {
        let store = Arc::new(MockStore::new());
        store.fail.store(true, Ordering::SeqCst);
        let engine = engine_with(Arc::clone(&store), config());
        engine.sign_in(admin()).unwrap();
        engine.ingest_raw("sale.created", sale_payload("E1"));
        let mut events = engine.subscribe();

        assert_eq!(engine.mark_all_read().unwrap(), 1);
        engine.flush_sync().await;

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let HubEvent::SyncFailed { operation, .. } = event {
                assert_eq!(operation, SyncOperation::MarkAllRead);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        assert_eq!(engine.unread_count(), 0);
    }

    #[tokio::test]
    async fn test_backfill_debounce() {
        let store = Arc::new(MockStore::new());
        let engine = engine_with(
            Arc::clone(&store),
            HubConfig {
                backfill_debounce_ms: 60_000,
                ..Default::default()
            },
        );
        engine.sign_in(admin()).unwrap();

        assert!(matches!(
            engine.backfill().await.unwrap(),
            BackfillOutcome::Merged { .. }
        ));
        assert_eq!(engine.backfill().await.unwrap(), BackfillOutcome::Skipped);
        assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backfill_failure_is_reported() {
        let store = Arc::new(MockStore::new());
        store.fail.store(true, Ordering::SeqCst);
        let engine = engine_with(Arc::clone(&store), config());
        engine.sign_in(admin()).unwrap();
        let mut events = engine.subscribe();

        let err = engine.backfill().await.unwrap_err();
        assert!(matches!(err, Error::RemoteSyncFailure { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            HubEvent::SyncFailed {
                operation: SyncOperation::Backfill,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_remote_ack_applies_without_emitting() {
        let store = Arc::new(MockStore::new());
        let engine = engine_with(Arc::clone(&store), config());
        engine.sign_in(admin()).unwrap();
        let id = engine
            .ingest_raw("sale.created", sale_payload("E1"))
            .into_notification()
            .unwrap()
            .id;

        engine
            .handle_signal(TransportSignal::Event {
                kind: "notification.read".into(),
                payload: json!({ "notificationId": id, "userId": "someone-else" }),
            })
            .await;
        assert_eq!(engine.unread_count(), 1);

        engine
            .handle_signal(TransportSignal::Event {
                kind: "notification.read".into(),
                payload: json!({ "notificationId": id, "userId": "U-admin" }),
            })
            .await;
        assert_eq!(engine.unread_count(), 0);

        engine.flush_sync().await;
        assert!(store.read_calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_scope_keeps_state_for_same_user() {
        let engine = engine_with(Arc::new(MockStore::new()), config());
        engine.sign_in(admin()).unwrap();
        engine.ingest_raw("sale.created", sale_payload("E1"));
        assert_eq!(engine.unread().get("/sales"), 1);

        engine
            .set_scope(ViewerScope::new(Role::Branch, "U-admin").with_branch("B1"))
            .unwrap();
        assert_eq!(engine.notifications().len(), 1);
        assert_eq!(engine.unread().get("/sales"), 0);
        assert_eq!(engine.unread().get("/branch-sales"), 1);
        assert_eq!(engine.subscribe_unread().borrow().get("/branch-sales"), 1);

        let err = engine
            .set_scope(ViewerScope::new(Role::Chef, "U-admin"))
            .unwrap_err();
        assert!(matches!(err, Error::ScopeUnavailable(_)));
        assert_eq!(engine.notifications().len(), 1);

        engine.set_scope(ViewerScope::new(Role::Admin, "U-other")).unwrap();
        assert!(engine.notifications().is_empty());
        assert!(engine.unread().is_empty());
    }

    #[tokio::test]
    async fn test_sign_out_drops_state() {
        let engine = engine_with(Arc::new(MockStore::new()), config());
        engine.sign_in(admin()).unwrap();
        engine.ingest_raw("sale.created", sale_payload("E1"));

        engine.sign_out();
        assert!(engine.notifications().is_empty());
        assert!(engine.unread().is_empty());
        assert!(engine.scope().is_none());

        engine.sign_in(admin()).unwrap();
        assert!(engine.ingest_raw("sale.created", sale_payload("E1")).is_accepted());
    }

    #[tokio::test]
    async fn test_run_loop_consumes_signals() {
        let bus = LocalBus::default();
        let session = Arc::new(bus.session());
        let engine = Arc::new(
            NotificationEngine::new(config(), Arc::new(MockStore::new()), session.clone()).unwrap(),
        );
        engine.sign_in(admin()).unwrap();
        let mut events = engine.subscribe();
        let handle = engine.start(session.subscribe());

        session.connect();
        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(HubEvent::BackfillMerged { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await;
        assert!(joined.is_ok());

        bus.publish("role:admin", "sale.created", sale_payload("E1"));
        let accepted = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(HubEvent::Accepted { notification, .. }) = events.recv().await {
                    return notification;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(accepted.event_id, "E1");
        assert!(accepted.created_at <= Utc::now());

        engine.stop().await;
        handle.await.unwrap();
    }
}
