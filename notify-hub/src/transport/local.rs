//! In-process room bus.
//!
//! Mirrors the room model of the real-time server closely enough to drive
//! the engine without a network: sessions join rooms, producers publish an
//! event to a room, and every session in that room receives it as a
//! [`TransportSignal::Event`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::{OutboundEvent, RoomJoin, Transport, TransportSignal};
use crate::Result;

type Members = HashMap<u64, broadcast::Sender<TransportSignal>>;

struct BusInner {
    rooms: Mutex<HashMap<String, Members>>,
    next_session: AtomicU64,
    buffer: usize,
}

impl BusInner {
    fn deliver(&self, room: &str, signal: &TransportSignal, except: Option<u64>) -> usize {
        let rooms = self.rooms.lock();
        let Some(members) = rooms.get(room) else {
            return 0;
        };

        members
            .iter()
            .filter(|(session, _)| Some(**session) != except)
            .filter(|(_, tx)| tx.send(signal.clone()).is_ok())
            .count()
    }

    fn leave_all(&self, session: u64) {
        let mut rooms = self.rooms.lock();
        for members in rooms.values_mut() {
            members.remove(&session);
        }
        rooms.retain(|_, members| !members.is_empty());
    }
}

/// Shared room registry. Cheap to clone.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                rooms: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Open a new session on the bus. It joins no rooms until asked to.
    pub fn session(&self) -> LocalSession {
        let (tx, _) = broadcast::channel(self.inner.buffer);
        LocalSession {
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            bus: Arc::clone(&self.inner),
            tx,
            joins: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
        }
    }

    /// Publish `kind` to every session in `room`. Returns the number of
    /// sessions reached.
    pub fn publish(&self, room: &str, kind: &str, payload: Value) -> usize {
        let signal = TransportSignal::Event {
            kind: kind.to_string(),
            payload,
        };
        let delivered = self.inner.deliver(room, &signal, None);
        trace!(room, kind, delivered, "Published to room");
        delivered
    }

    pub fn members(&self, room: &str) -> usize {
        self.inner.rooms.lock().get(room).map_or(0, HashMap::len)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One connection on a [`LocalBus`].
pub struct LocalSession {
    id: u64,
    bus: Arc<BusInner>,
    tx: broadcast::Sender<TransportSignal>,
    joins: Mutex<Vec<RoomJoin>>,
    emitted: Mutex<Vec<OutboundEvent>>,
}

impl LocalSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Inbound signals for this session.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportSignal> {
        self.tx.subscribe()
    }

    /// Report a (re)established connection to the subscribers.
    pub fn connect(&self) {
        let _ = self.tx.send(TransportSignal::Connected);
    }

    /// Drop out of every room and report the disconnect.
    pub fn disconnect(&self, reason: impl Into<String>) {
        self.bus.leave_all(self.id);
        let _ = self.tx.send(TransportSignal::Disconnected {
            reason: reason.into(),
        });
    }

    pub fn connect_error(&self, message: impl Into<String>) {
        let _ = self.tx.send(TransportSignal::ConnectError {
            message: message.into(),
        });
    }

    /// Every join request received, oldest first.
    pub fn joins(&self) -> Vec<RoomJoin> {
        self.joins.lock().clone()
    }

    /// Every acknowledgement emitted, oldest first.
    pub fn emitted(&self) -> Vec<OutboundEvent> {
        self.emitted.lock().clone()
    }

    /// Rooms the session is currently a member of.
    pub fn rooms(&self) -> Vec<String> {
        let rooms = self.bus.rooms.lock();
        let mut joined: Vec<String> = rooms
            .iter()
            .filter(|(_, members)| members.contains_key(&self.id))
            .map(|(room, _)| room.clone())
            .collect();
        joined.sort();
        joined
    }
}

#[async_trait]
impl Transport for LocalSession {
    async fn join(&self, join: &RoomJoin) -> Result<()> {
        self.bus.leave_all(self.id);
        {
            let mut rooms = self.bus.rooms.lock();
            for room in &join.rooms {
                rooms
                    .entry(room.clone())
                    .or_default()
                    .insert(self.id, self.tx.clone());
            }
        }
        debug!(session = self.id, user_id = %join.user_id, rooms = ?join.rooms, "Joined rooms");
        self.joins.lock().push(join.clone());
        Ok(())
    }

    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        let room = format!("user:{}", event.user_id());
        let signal = TransportSignal::Event {
            kind: event.kind().to_string(),
            payload: event.payload(),
        };
        let delivered = self.bus.deliver(&room, &signal, Some(self.id));
        debug!(session = self.id, kind = event.kind(), delivered, "Emitted acknowledgement");
        self.emitted.lock().push(event);
        Ok(())
    }
}
