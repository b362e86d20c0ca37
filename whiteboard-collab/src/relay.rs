//! Cross-process fan-out and shared persistence.
//!
//! Several server processes can serve the same room. Each one keeps its
//! local [`LocalBroadcaster`] and joins a relay hub over a WebSocket link.
//! The hub routes publishes between links and owns the room stores, so
//! every server reads and writes one copy of each room:
//!
//! ```text
//!  server 1 ─┐  subscribe / publish / persist   ┌──────────┐
//!  server 2 ─┼────────────────────────────────► │ RelayHub │ ── publish to every other link in the room
//!  server 3 ─┘ ◄────────────────────────────────┤          │ ── persist / loadState / flush to RoomWriters
//!               publish / state / flushed       └──────────┘
//! ```
//!
//! A publish is delivered locally first and then forwarded, so local peers
//! never wait on the hub. A link's frames are applied in the order they were
//! sent. Links are not re-established after a drop; pending state reads then
//! resolve as empty.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastError, Broadcaster, ConnectionId, Envelope, LocalBroadcaster, Subscription};
use crate::compaction::Compactor;
use crate::config::WhiteboardConfig;
use crate::drawing::{Drawing, DrawingRecord, UndoRedoAction};
use crate::error::PersistenceError;
use crate::storage::{FsSnapshotStore, RocksHotLog};
use crate::writer::{PersistJob, RoomStore, RoomWriters};

/// Relay hub configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9091".to_string(),
        }
    }
}

/// A write job as shipped to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum StoreOp {
    Save(Vec<Drawing>),
    Remove(Vec<Drawing>),
    Transform(Vec<Drawing>),
    UndoRedo(UndoRedoAction),
}

impl StoreOp {
    fn into_job(self) -> PersistJob {
        match self {
            StoreOp::Save(drawings) => PersistJob::Save(drawings),
            StoreOp::Remove(drawings) => PersistJob::Remove(drawings),
            StoreOp::Transform(drawings) => PersistJob::Transform(drawings),
            StoreOp::UndoRedo(action) => PersistJob::UndoRedo(action),
        }
    }
}

/// Frames exchanged between servers and the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RelayFrame {
    #[serde(rename_all = "camelCase")]
    Subscribe { room_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { room_id: String },
    #[serde(rename_all = "camelCase")]
    Publish { instance_id: Uuid, envelope: Envelope },
    #[serde(rename_all = "camelCase")]
    Persist { room_id: String, job: StoreOp },
    #[serde(rename_all = "camelCase")]
    LoadState { room_id: String, request_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Flush { room_id: String, request_id: Uuid },
    /// Hub reply to `loadState`: merged records, tombstones included
    #[serde(rename_all = "camelCase")]
    State { request_id: Uuid, drawings: Vec<DrawingRecord> },
    /// Hub reply to `flush`
    #[serde(rename_all = "camelCase")]
    Flushed { request_id: Uuid },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<String, BroadcastError> {
        serde_json::to_string(self).map_err(|e| BroadcastError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, BroadcastError> {
        serde_json::from_str(text).map_err(|e| BroadcastError::Decode(e.to_string()))
    }
}

type LinkId = Uuid;
type LinkSender = mpsc::UnboundedSender<Arc<str>>;
type Topics = Arc<RwLock<HashMap<String, HashMap<LinkId, LinkSender>>>>;

// ─── Hub ──────────────────────────────────────────────────────────────

/// Standalone backbone between server processes: pub/sub plus room storage.
pub struct RelayHub {
    config: RelayConfig,
    topics: Topics,
    writers: RoomWriters,
}

impl RelayHub {
    pub fn new(config: RelayConfig, writers: RoomWriters) -> Self {
        Self {
            config,
            topics: Arc::new(RwLock::new(HashMap::new())),
            writers,
        }
    }

    /// Open the configured stores and build a hub that owns them.
    pub fn open(config: &WhiteboardConfig) -> Result<Self, PersistenceError> {
        let hot_log = Arc::new(RocksHotLog::open(config.hot_log.clone())?);
        let snapshots = Arc::new(FsSnapshotStore::open(config.snapshots.clone())?);
        let compactor = Arc::new(Compactor::new(hot_log, snapshots, config.compaction));
        Ok(Self::new(config.relay.clone(), RoomWriters::new(compactor)))
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept server links on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Relay hub listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            let topics = self.topics.clone();
            let writers = self.writers.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_link(stream, topics, writers).await {
                    log::error!("Relay link error from {addr}: {e}");
                }
            });
        }
    }

    /// Number of links subscribed to a room.
    pub async fn subscriber_count(&self, room_id: &str) -> usize {
        self.topics.read().await.get(room_id).map_or(0, HashMap::len)
    }

    pub fn writers(&self) -> &RoomWriters {
        &self.writers
    }

    async fn handle_link(
        stream: TcpStream,
        topics: Topics,
        writers: RoomWriters,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let link_id: LinkId = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<str>>();
        log::info!("Relay link {link_id} connected");

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_sender.send(Message::Text(text.to_string().into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = ws_receiver.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Relay link {link_id} read error: {e}");
                    break;
                }
            };

            match RelayFrame::decode(text.as_str()) {
                Ok(RelayFrame::Subscribe { room_id }) => {
                    topics.write().await.entry(room_id).or_default().insert(link_id, tx.clone());
                }
                Ok(RelayFrame::Unsubscribe { room_id }) => {
                    let mut topics = topics.write().await;
                    if let Some(links) = topics.get_mut(&room_id) {
                        links.remove(&link_id);
                        if links.is_empty() {
                            topics.remove(&room_id);
                            writers.retire(&room_id);
                        }
                    }
                }
                Ok(RelayFrame::Publish { envelope, .. }) => {
                    let shared: Arc<str> = Arc::from(text.as_str());
                    let topics = topics.read().await;
                    if let Some(links) = topics.get(&envelope.room_id) {
                        for (id, link) in links {
                            if *id != link_id {
                                let _ = link.send(shared.clone());
                            }
                        }
                    }
                }
                Ok(RelayFrame::Persist { room_id, job }) => writers.enqueue(&room_id, job.into_job()),
                Ok(RelayFrame::LoadState { room_id, request_id }) => {
                    let (state_tx, state_rx) = oneshot::channel();
                    writers.enqueue(&room_id, PersistJob::LoadState(state_tx));
                    let link = tx.clone();
                    tokio::spawn(async move {
                        let drawings = state_rx.await.unwrap_or_default();
                        reply(&link, RelayFrame::State { request_id, drawings });
                    });
                }
                Ok(RelayFrame::Flush { room_id, request_id }) => {
                    let (done_tx, done_rx) = oneshot::channel();
                    writers.enqueue(&room_id, PersistJob::Flush(done_tx));
                    let link = tx.clone();
                    tokio::spawn(async move {
                        let _ = done_rx.await;
                        reply(&link, RelayFrame::Flushed { request_id });
                    });
                }
                Ok(frame @ (RelayFrame::State { .. } | RelayFrame::Flushed { .. })) => {
                    log::warn!("Relay link {link_id} sent a hub-only frame: {frame:?}");
                }
                Err(e) => log::warn!("Relay link {link_id} sent an invalid frame: {e}"),
            }
        }

        {
            let mut topics = topics.write().await;
            topics.retain(|room_id, links| {
                links.remove(&link_id);
                if links.is_empty() {
                    writers.retire(room_id);
                    return false;
                }
                true
            });
        }
        writer.abort();
        log::info!("Relay link {link_id} closed");
        Ok(())
    }
}

fn reply(link: &LinkSender, frame: RelayFrame) {
    match frame.encode() {
        Ok(text) => {
            let _ = link.send(Arc::from(text));
        }
        Err(e) => log::error!("Dropping hub reply: {e}"),
    }
}

// ─── Server side ──────────────────────────────────────────────────────

enum Pending {
    State(oneshot::Sender<Vec<DrawingRecord>>),
    Flushed(oneshot::Sender<()>),
}

/// Requests waiting for a hub reply.
#[derive(Default)]
struct PendingRequests {
    closed: bool,
    waiting: HashMap<Uuid, Pending>,
}

/// One server's connection to the relay hub.
///
/// Hands out the [`RelayBroadcaster`] and [`RelayStore`] that share it.
#[derive(Clone)]
pub struct RelayLink {
    instance_id: Uuid,
    local: LocalBroadcaster,
    outgoing: mpsc::UnboundedSender<RelayFrame>,
    pending: Arc<Mutex<PendingRequests>>,
}

impl RelayLink {
    /// Connect to the hub at `url` (`ws://host:port`).
    pub async fn connect(url: &str, capacity: usize) -> Result<Self, BroadcastError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BroadcastError::RelayUnavailable(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let instance_id = Uuid::new_v4();
        let local = LocalBroadcaster::new(capacity);
        let pending = Arc::new(Mutex::new(PendingRequests::default()));
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<RelayFrame>();

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Dropping relay frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    log::error!("Relay link lost: {e}");
                    break;
                }
            }
        });

        let inbound = local.clone();
        let replies = pending.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match RelayFrame::decode(text.as_str()) {
                        Ok(RelayFrame::Publish { instance_id: from, envelope }) if from != instance_id => {
                            inbound.deliver(Arc::new(envelope)).await;
                        }
                        Ok(RelayFrame::State { request_id, drawings }) => {
                            if let Some(Pending::State(reply)) = take_pending(&replies, &request_id) {
                                let _ = reply.send(drawings);
                            }
                        }
                        Ok(RelayFrame::Flushed { request_id }) => {
                            if let Some(Pending::Flushed(reply)) = take_pending(&replies, &request_id) {
                                let _ = reply.send(());
                            }
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("Invalid frame from relay hub: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Relay link read error: {e}");
                        break;
                    }
                }
            }

            // Dropping the senders resolves every waiting request
            let mut pending = replies.lock().unwrap_or_else(PoisonError::into_inner);
            pending.closed = true;
            pending.waiting.clear();
            log::warn!("Relay link closed; fan-out is now local only and room state reads as empty");
        });

        log::info!("Joined relay hub at {url} as instance {instance_id}");
        Ok(Self {
            instance_id,
            local,
            outgoing,
            pending,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn broadcaster(&self) -> RelayBroadcaster {
        RelayBroadcaster { link: self.clone() }
    }

    pub fn store(&self) -> RelayStore {
        RelayStore { link: self.clone() }
    }

    fn forward(&self, frame: RelayFrame) -> Result<(), BroadcastError> {
        self.outgoing
            .send(frame)
            .map_err(|_| BroadcastError::RelayUnavailable("relay link closed".to_string()))
    }

    /// Send a request frame and park its reply channel until the hub answers.
    fn request(&self, reply: Pending, frame: impl FnOnce(Uuid) -> RelayFrame) -> Result<(), BroadcastError> {
        let request_id = Uuid::new_v4();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.closed {
                return Err(BroadcastError::RelayUnavailable("relay link closed".to_string()));
            }
            pending.waiting.insert(request_id, reply);
        }
        self.forward(frame(request_id)).inspect_err(|_| {
            take_pending(&self.pending, &request_id);
        })
    }
}

fn take_pending(pending: &Mutex<PendingRequests>, request_id: &Uuid) -> Option<Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner).waiting.remove(request_id)
}

/// [`Broadcaster`] that fans out locally and through a relay hub.
#[derive(Clone)]
pub struct RelayBroadcaster {
    link: RelayLink,
}

impl RelayBroadcaster {
    /// Connect to the hub for fan-out only.
    pub async fn connect(url: &str, capacity: usize) -> Result<Self, BroadcastError> {
        Ok(RelayLink::connect(url, capacity).await?.broadcaster())
    }

    pub fn instance_id(&self) -> Uuid {
        self.link.instance_id
    }

    pub fn local(&self) -> &LocalBroadcaster {
        &self.link.local
    }
}

#[async_trait]
impl Broadcaster for RelayBroadcaster {
    async fn subscribe(&self, room_id: &str, peer: ConnectionId) -> Subscription {
        self.link
            .local
            .subscribe_then(room_id, peer, || {
                if let Err(e) = self.link.forward(RelayFrame::Subscribe { room_id: room_id.to_string() }) {
                    log::warn!("Could not subscribe to room {room_id} on relay: {e}");
                }
            })
            .await
    }

    async fn unsubscribe(&self, room_id: &str, peer: &ConnectionId) -> bool {
        self.link
            .local
            .unsubscribe_then(room_id, peer, || {
                if let Err(e) = self.link.forward(RelayFrame::Unsubscribe { room_id: room_id.to_string() }) {
                    log::debug!("Could not unsubscribe from room {room_id} on relay: {e}");
                }
            })
            .await
    }

    async fn publish(&self, envelope: Envelope) -> Result<usize, BroadcastError> {
        let shared = Arc::new(envelope);
        let reached = self.link.local.deliver(shared.clone()).await;
        self.link.forward(RelayFrame::Publish {
            instance_id: self.link.instance_id,
            envelope: Arc::unwrap_or_clone(shared),
        })?;
        Ok(reached)
    }

    async fn peer_count(&self, room_id: &str) -> usize {
        self.link.local.peer_count(room_id).await
    }

    async fn room_count(&self) -> usize {
        self.link.local.room_count().await
    }
}

/// [`RoomStore`] whose rooms live on the relay hub.
#[derive(Clone)]
pub struct RelayStore {
    link: RelayLink,
}

#[async_trait]
impl RoomStore for RelayStore {
    fn enqueue(&self, room_id: &str, job: PersistJob) {
        let room = room_id.to_string();
        let sent = match job {
            PersistJob::Save(drawings) => self.persist(room, StoreOp::Save(drawings)),
            PersistJob::Remove(drawings) => self.persist(room, StoreOp::Remove(drawings)),
            PersistJob::Transform(drawings) => self.persist(room, StoreOp::Transform(drawings)),
            PersistJob::UndoRedo(action) => self.persist(room, StoreOp::UndoRedo(action)),
            PersistJob::LoadState(reply) => self.link.request(Pending::State(reply), |request_id| {
                RelayFrame::LoadState { room_id: room, request_id }
            }),
            PersistJob::Flush(done) => self.link.request(Pending::Flushed(done), |request_id| {
                RelayFrame::Flush { room_id: room, request_id }
            }),
        };
        if let Err(e) = sent {
            log::error!("Failed to ship persistence for room {room_id} to relay: {e}");
        }
    }

    /// The hub retires a room's writer once no link is subscribed to it.
    fn retire(&self, _room_id: &str) {}
}

impl RelayStore {
    fn persist(&self, room_id: String, job: StoreOp) -> Result<(), BroadcastError> {
        self.link.forward(RelayFrame::Persist { room_id, job })
    }
}
