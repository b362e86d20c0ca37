//! Room fan-out.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers of a room.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` envelopes. A receiver that falls further behind gets a
//! [`Delivery::Lagged`] marker and must resync from the stored state.
//!
//! ```text
//!   session A ── publish(Envelope{origin: A}) ──► BroadcastGroup("r1")
//!                                                   ├──► session A (skipped: own origin)
//!                                                   ├──► session B
//!                                                   └──► session C
//! ```
//!
//! [`Broadcaster`] is the seam between sessions and the pub/sub backend.
//! [`LocalBroadcaster`] serves a single process; `relay::RelayBroadcaster`
//! extends it across processes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::ServerEvent;

/// Identity of one client connection.
pub type ConnectionId = Uuid;

/// A server event addressed to a room, tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub room_id: String,
    pub origin: ConnectionId,
    pub event: ServerEvent,
}

impl Envelope {
    pub fn new(room_id: impl Into<String>, origin: ConnectionId, event: ServerEvent) -> Self {
        Self {
            room_id: room_id.into(),
            origin,
            event,
        }
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Cross-process backbone is gone; local peers were still reached
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// What a subscription yields.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Arc<Envelope>),
    /// The receiver fell behind and this many events were dropped.
    /// The peer's view is stale until it reloads the room.
    Lagged(u64),
}

/// One connection's view of a room.
pub struct Subscription {
    peer: ConnectionId,
    room_id: String,
    rx: broadcast::Receiver<Arc<Envelope>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Next envelope from another connection, in publish order.
    ///
    /// Returns `None` once the room's group is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.origin == self.peer => continue,
                Ok(envelope) => return Some(Delivery::Event(envelope)),
                Err(RecvError::Lagged(skipped)) => {
                    self.stats.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
                    log::warn!("Peer {} lagged in room {}, dropped {skipped} events", self.peer, self.room_id);
                    return Some(Delivery::Lagged(skipped));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Pub/sub capability used by room sessions.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Add a connection to a room's group.
    async fn subscribe(&self, room_id: &str, peer: ConnectionId) -> Subscription;

    /// Remove a connection. Returns true when the room has no local peers left.
    async fn unsubscribe(&self, room_id: &str, peer: &ConnectionId) -> bool;

    /// Deliver to every member of the envelope's room, in publish order.
    /// Returns the number of local receivers reached.
    async fn publish(&self, envelope: Envelope) -> Result<usize, BroadcastError>;

    async fn peer_count(&self, room_id: &str) -> usize;

    /// Rooms with at least one local peer.
    async fn room_count(&self) -> usize;
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    room_id: String,
    sender: broadcast::Sender<Arc<Envelope>>,
    peers: RwLock<HashSet<ConnectionId>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(room_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            room_id: room_id.into(),
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub async fn add_peer(&self, peer: ConnectionId) -> Subscription {
        self.peers.write().await.insert(peer);
        Subscription {
            peer,
            room_id: self.room_id.clone(),
            rx: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    pub async fn remove_peer(&self, peer: &ConnectionId) -> bool {
        self.peers.write().await.remove(peer)
    }

    /// Lock-free: tokio broadcast send + atomic stats.
    pub fn send(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer: &ConnectionId) -> bool {
        self.peers.read().await.contains(peer)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Single-process broadcaster: room ids to broadcast groups.
#[derive(Clone)]
pub struct LocalBroadcaster {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl LocalBroadcaster {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Add a peer to a room, creating its group if needed. `on_first` runs
    /// when the peer is the room's first, still under the room map lock, so
    /// it is ordered against every other join and leave of the room.
    pub async fn subscribe_then<F>(&self, room_id: &str, peer: ConnectionId, on_first: F) -> Subscription
    where
        F: FnOnce() + Send,
    {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(room_id, self.default_capacity)))
            .clone();
        let subscription = group.add_peer(peer).await;
        if group.peer_count().await == 1 {
            on_first();
        }
        subscription
    }

    /// Remove a peer and drop the room's group once it is empty. `on_empty`
    /// runs under the room map lock when the group is dropped.
    /// Returns true when the room has no peers left.
    pub async fn unsubscribe_then<F>(&self, room_id: &str, peer: &ConnectionId, on_empty: F) -> bool
    where
        F: FnOnce() + Send,
    {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room_id).cloned() else {
            return true;
        };
        group.remove_peer(peer).await;
        if group.peer_count().await > 0 {
            return false;
        }
        rooms.remove(room_id);
        on_empty();
        log::info!("Room {room_id} is empty, releasing its broadcast group");
        true
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Hand an already-shared envelope to the local group, if any.
    pub async fn deliver(&self, envelope: Arc<Envelope>) -> usize {
        match self.get(&envelope.room_id).await {
            Some(group) => group.send(envelope),
            None => 0,
        }
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn subscribe(&self, room_id: &str, peer: ConnectionId) -> Subscription {
        self.subscribe_then(room_id, peer, || {}).await
    }

    async fn unsubscribe(&self, room_id: &str, peer: &ConnectionId) -> bool {
        self.unsubscribe_then(room_id, peer, || {}).await
    }

    async fn publish(&self, envelope: Envelope) -> Result<usize, BroadcastError> {
        Ok(self.deliver(Arc::new(envelope)).await)
    }

    async fn peer_count(&self, room_id: &str) -> usize {
        match self.get(room_id).await {
            Some(group) => group.peer_count().await,
            None => 0,
        }
    }

    async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
