//! Room sessions: the per-connection state machine.
//!
//! ```text
//!            join(r)                 join(r')
//! Connected ────────► Joined(r) ─────────────► Joined(r')   (leaves r first)
//!     │                  │
//!     └──── disconnect ──┴──────────────────► Disconnected
//! ```
//!
//! Every edit is broadcast to the other connections in the room before its
//! persistence is queued, so peers see it even if storage is down. Storage
//! faults are logged and never reach the client. A connection that falls
//! behind the room's fan-out buffer is sent a fresh `roomData`.

use std::sync::Arc;

use crate::broadcast::{Broadcaster, ConnectionId, Delivery, Envelope, Subscription};
use crate::compaction::{CompactionPolicy, Compactor};
use crate::drawing::{self, Drawing};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::storage::{HotLog, SnapshotStore};
use crate::undo::UndoRedoCoordinator;
use crate::writer::{PersistJob, RoomStore, RoomWriters};

/// Shared engine behind every session: fan-out and room persistence.
pub struct WhiteboardService {
    broadcaster: Arc<dyn Broadcaster>,
    store: Arc<dyn RoomStore>,
    /// Set when this process owns the stores
    local: Option<RoomWriters>,
    undo: UndoRedoCoordinator,
}

impl WhiteboardService {
    pub fn new(
        hot_log: Arc<dyn HotLog>,
        snapshots: Arc<dyn SnapshotStore>,
        broadcaster: Arc<dyn Broadcaster>,
        policy: CompactionPolicy,
    ) -> Arc<Self> {
        let compactor = Arc::new(Compactor::new(hot_log, snapshots, policy));
        let writers = RoomWriters::new(compactor);
        Self::build(Arc::new(writers.clone()), Some(writers), broadcaster)
    }

    /// Service whose persistence lives elsewhere, e.g. behind a relay hub.
    pub fn with_store(store: Arc<dyn RoomStore>, broadcaster: Arc<dyn Broadcaster>) -> Arc<Self> {
        Self::build(store, None, broadcaster)
    }

    fn build(store: Arc<dyn RoomStore>, local: Option<RoomWriters>, broadcaster: Arc<dyn Broadcaster>) -> Arc<Self> {
        let undo = UndoRedoCoordinator::new(broadcaster.clone(), store.clone());
        Arc::new(Self {
            broadcaster,
            store,
            local,
            undo,
        })
    }

    pub fn open_session(self: &Arc<Self>) -> RoomSession {
        RoomSession::new(self.clone())
    }

    /// Live drawings of a room, snapshot order first, tombstones dropped.
    pub async fn current_state(&self, room_id: &str) -> Vec<Drawing> {
        self.store
            .load_state(room_id)
            .await
            .iter()
            .filter(|record| record.is_live())
            .map(drawing::from_record)
            .collect()
    }

    pub fn broadcaster(&self) -> &Arc<dyn Broadcaster> {
        &self.broadcaster
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    /// Wait until every edit accepted for the room so far is persisted.
    pub async fn flush(&self, room_id: &str) {
        self.store.flush(room_id).await;
    }

    /// Writers of this process, when it owns the stores.
    pub fn local_writers(&self) -> Option<&RoomWriters> {
        self.local.as_ref()
    }

    pub fn compactor(&self) -> Option<&Arc<Compactor>> {
        self.local.as_ref().map(RoomWriters::compactor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Joined { room_id: String },
    Disconnected,
}

/// One client connection's view of the whiteboard.
pub struct RoomSession {
    id: ConnectionId,
    state: SessionState,
    subscription: Option<Subscription>,
    service: Arc<WhiteboardService>,
}

impl RoomSession {
    pub fn new(service: Arc<WhiteboardService>) -> Self {
        Self {
            id: ConnectionId::new_v4(),
            state: SessionState::Connected,
            subscription: None,
            service,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Joined { room_id } => Some(room_id),
            _ => None,
        }
    }

    /// Handle one client event. Returns the events addressed to this client only.
    pub async fn handle(&mut self, event: ClientEvent) -> Vec<ServerEvent> {
        if self.state == SessionState::Disconnected {
            log::warn!("Ignoring {} from disconnected session {}", event.name(), self.id);
            return Vec::new();
        }

        match event {
            ClientEvent::Join(payload) => vec![ServerEvent::RoomData(self.join(&payload.room_id).await)],
            ClientEvent::Drawing(payload) => {
                let (room_id, job) = (payload.room_id.clone(), PersistJob::Save(payload.drawings.clone()));
                self.edit(&room_id, ServerEvent::Drawing(payload), job).await;
                Vec::new()
            }
            ClientEvent::DrawingEnd(payload) => {
                let (room_id, job) = (payload.room_id.clone(), PersistJob::Save(vec![payload.drawing.clone()]));
                self.edit(&room_id, ServerEvent::DrawingEnd(payload), job).await;
                Vec::new()
            }
            ClientEvent::Transform(payload) => {
                let (room_id, job) = (payload.room_id.clone(), PersistJob::Transform(payload.drawings.clone()));
                self.edit(&room_id, ServerEvent::Transform(payload), job).await;
                Vec::new()
            }
            ClientEvent::Remove(payload) => {
                let (room_id, job) = (payload.room_id.clone(), PersistJob::Remove(payload.drawings.clone()));
                self.edit(&room_id, ServerEvent::Remove(payload), job).await;
                Vec::new()
            }
            ClientEvent::Undo(payload) => {
                if self.accepts(&payload.room_id, "undo") {
                    self.service.undo.undo(self.id, payload).await;
                }
                Vec::new()
            }
            ClientEvent::Redo(payload) => {
                if self.accepts(&payload.room_id, "redo") {
                    self.service.undo.redo(self.id, payload).await;
                }
                Vec::new()
            }
        }
    }

    /// Join a room: subscribe, announce, then load the merged state.
    ///
    /// Joining while in another room leaves that room first.
    pub async fn join(&mut self, room_id: &str) -> Vec<Drawing> {
        if self.room_id() != Some(room_id) {
            self.leave().await;
            self.subscription = Some(self.service.broadcaster.subscribe(room_id, self.id).await);
            self.state = SessionState::Joined { room_id: room_id.to_string() };
            log::info!("Connection {} joined room {room_id}", self.id);

            let announce = Envelope::new(room_id, self.id, ServerEvent::UserEntered(self.id.to_string()));
            if let Err(e) = self.service.broadcaster.publish(announce).await {
                log::error!("Failed to announce {} in room {room_id}: {e}", self.id);
            }
        }

        self.service.current_state(room_id).await
    }

    /// Next event published by another connection in the joined room.
    ///
    /// After falling behind the fan-out buffer the connection gets the
    /// room's current state as `roomData` instead of the dropped events.
    /// Pends forever while not joined; `None` once the room group is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        let Some(subscription) = self.subscription.as_mut() else {
            return std::future::pending().await;
        };
        match subscription.recv().await? {
            Delivery::Event(envelope) => Some(envelope.event.clone()),
            Delivery::Lagged(_) => {
                let room_id = subscription.room_id().to_string();
                log::warn!("Connection {} fell behind in room {room_id}, resending room state", self.id);
                Some(ServerEvent::RoomData(self.service.current_state(&room_id).await))
            }
        }
    }

    pub async fn disconnect(&mut self) {
        self.leave().await;
        self.state = SessionState::Disconnected;
        log::debug!("Connection {} disconnected", self.id);
    }

    async fn leave(&mut self) {
        let SessionState::Joined { room_id } = std::mem::replace(&mut self.state, SessionState::Connected) else {
            return;
        };
        self.subscription = None;
        if self.service.broadcaster.unsubscribe(&room_id, &self.id).await {
            self.service.store.retire(&room_id);
        }
        log::info!("Connection {} left room {room_id}", self.id);
    }

    fn accepts(&self, room_id: &str, what: &str) -> bool {
        if self.room_id() == Some(room_id) {
            return true;
        }
        log::warn!(
            "Dropping {what} for room {room_id} from connection {} (joined: {:?})",
            self.id,
            self.room_id()
        );
        false
    }

    /// Broadcast first, then queue persistence.
    async fn edit(&self, room_id: &str, event: ServerEvent, job: PersistJob) {
        if !self.accepts(room_id, event.name()) {
            return;
        }
        let name = event.name();
        if let Err(e) = self.service.broadcaster.publish(Envelope::new(room_id, self.id, event)).await {
            log::error!("Failed to broadcast {name} in room {room_id}: {e}");
        }
        self.service.store.enqueue(room_id, job);
    }
}
