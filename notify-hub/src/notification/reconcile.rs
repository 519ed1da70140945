//! Reconnection reconciliation.
//!
//! On every (re)connect the viewer rejoins its rooms and the engine backfills
//! whatever it missed while offline. Local state is never cleared or
//! replayed; the backfill merge resolves overlaps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::events::{ConnectionState, HubEvent, SyncOperation};
use super::service::{BackfillOutcome, NotificationEngine};
use crate::Result;
use crate::transport::RoomJoin;

/// Connection bookkeeping kept by the engine.
#[derive(Debug, Default)]
pub struct ReconcilerState {
    connected_once: AtomicBool,
    connects: AtomicU64,
    reconnects: AtomicU64,
    disconnects: AtomicU64,
    connect_errors: AtomicU64,
    joins: AtomicU64,
    join_failures: AtomicU64,
    backfill_failures: AtomicU64,
    connection: Mutex<Option<ConnectionState>>,
}

impl ReconcilerState {
    fn set_connection(&self, state: ConnectionState) {
        *self.connection.lock() = Some(state);
    }

    pub fn snapshot(&self) -> ReconcilerStats {
        ReconcilerStats {
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            connect_errors: self.connect_errors.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            join_failures: self.join_failures.load(Ordering::Relaxed),
            backfill_failures: self.backfill_failures.load(Ordering::Relaxed),
        }
    }
}

/// Counters describing the connection history of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerStats {
    pub connects: u64,
    /// Connects after the first one.
    pub reconnects: u64,
    pub disconnects: u64,
    pub connect_errors: u64,
    pub joins: u64,
    pub join_failures: u64,
    pub backfill_failures: u64,
}

impl NotificationEngine {
    /// Rejoin rooms and backfill after the transport (re)connects.
    ///
    /// Fails only when no complete viewer scope is installed. Join and
    /// backfill failures are reported as [`HubEvent::SyncFailed`] and leave
    /// local state untouched.
    pub async fn handle_connect(&self) -> Result<()> {
        let state = &self.reconciler;
        state.connects.fetch_add(1, Ordering::Relaxed);
        if state.connected_once.swap(true, Ordering::Relaxed) {
            state.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        state.set_connection(ConnectionState::Connected);
        self.publish(HubEvent::Connection(ConnectionState::Connected));

        let scope = match self.require_scope() {
            Ok(scope) => scope,
            Err(e) => {
                warn!("Connected without a usable viewer scope: {}", e);
                return Err(e);
            }
        };

        let join = RoomJoin::from(&scope);
        match self.transport.join(&join).await {
            Ok(()) => {
                state.joins.fetch_add(1, Ordering::Relaxed);
                debug!(user_id = %scope.user_id, rooms = ?join.rooms, "Rejoined rooms");
            }
            Err(e) => {
                state.join_failures.fetch_add(1, Ordering::Relaxed);
                warn!(user_id = %scope.user_id, "Room join failed: {}", e);
                self.publish(HubEvent::sync_failed(SyncOperation::Join, e.to_string()));
            }
        }

        match self.backfill().await {
            Ok(BackfillOutcome::Merged { fetched, added }) => {
                info!(fetched, added, "Reconnected and reconciled");
            }
            Ok(outcome) => debug!(?outcome, "Reconnect backfill not merged"),
            Err(e) => {
                // Already published as a sync failure; the next connect retries.
                state.backfill_failures.fetch_add(1, Ordering::Relaxed);
                debug!("Reconnect backfill failed: {}", e);
            }
        }

        Ok(())
    }

    /// Record a disconnect. State is kept for the next reconnect.
    pub fn handle_disconnect(&self, reason: &str) {
        self.reconciler.disconnects.fetch_add(1, Ordering::Relaxed);
        info!(reason, "Transport disconnected");
        let state = ConnectionState::Disconnected {
            reason: reason.to_string(),
        };
        self.reconciler.set_connection(state.clone());
        self.publish(HubEvent::Connection(state));
    }

    /// Record a failed connection attempt.
    pub fn handle_connect_error(&self, message: &str) {
        self.reconciler.connect_errors.fetch_add(1, Ordering::Relaxed);
        warn!(message, "Transport connection failed");
        let state = ConnectionState::Failed {
            message: message.to_string(),
        };
        self.reconciler.set_connection(state.clone());
        self.publish(HubEvent::Connection(state));
    }

    /// Last connection state reported by the transport.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.reconciler.connection.lock().clone()
    }

    pub fn reconciler_stats(&self) -> ReconcilerStats {
        self.reconciler.snapshot()
    }
}
