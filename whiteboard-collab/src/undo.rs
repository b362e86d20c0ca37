//! Undo/redo coordination.
//!
//! Undo and redo are computed by the client. The server relays the resulting
//! batch to the rest of the room (`undoDrawings` / `redoDrawings`) and then
//! applies it to the hot log on the room's writer:
//!
//! | action | per entry |
//! |---|---|
//! | `delete` | soft delete |
//! | `restore` | clear the tombstone |
//! | `transform` | full-field overwrite |
//!
//! A batch with any entry lacking an id is rejected as a whole.

use std::sync::Arc;

use crate::broadcast::{Broadcaster, ConnectionId, Envelope};
use crate::drawing::UndoRedoAction;
use crate::error::{StoreError, ValidationError};
use crate::protocol::{RedoPayload, ServerEvent, UndoPayload};
use crate::storage::HotLog;
use crate::writer::{PersistJob, RoomStore};

/// Result of applying one batch.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    /// `(drawing id, error)` for entries the store rejected
    pub failed: Vec<(String, StoreError)>,
}

/// Check every entry, then dispatch each one by action.
pub fn apply(hot_log: &dyn HotLog, room_id: &str, action: &UndoRedoAction) -> Result<ApplyReport, ValidationError> {
    for drawing in action.drawings() {
        drawing.require_id(action.name())?;
    }

    let mut report = ApplyReport::default();
    for drawing in action.drawings() {
        let result = match action {
            UndoRedoAction::Delete(_) => hot_log.soft_delete(room_id, drawing),
            UndoRedoAction::Restore(_) => hot_log.restore(room_id, drawing),
            UndoRedoAction::Transform(_) => hot_log.apply_transform(room_id, drawing),
        };
        match result {
            Ok(_) => report.applied += 1,
            Err(e) => report.failed.push((drawing.id().unwrap_or_default().to_string(), e)),
        }
    }
    Ok(report)
}

/// Relays undo/redo batches, then queues their persistence.
pub struct UndoRedoCoordinator {
    broadcaster: Arc<dyn Broadcaster>,
    store: Arc<dyn RoomStore>,
}

impl UndoRedoCoordinator {
    pub fn new(broadcaster: Arc<dyn Broadcaster>, store: Arc<dyn RoomStore>) -> Self {
        Self { broadcaster, store }
    }

    pub async fn undo(&self, origin: ConnectionId, payload: UndoPayload) {
        let room_id = payload.room_id.clone();
        let action = payload.undo_result.clone();
        self.relay(origin, &room_id, ServerEvent::UndoDrawings(payload), action).await;
    }

    pub async fn redo(&self, origin: ConnectionId, payload: RedoPayload) {
        let room_id = payload.room_id.clone();
        let action = payload.redo_result.clone();
        self.relay(origin, &room_id, ServerEvent::RedoDrawings(payload), action).await;
    }

    async fn relay(&self, origin: ConnectionId, room_id: &str, event: ServerEvent, action: UndoRedoAction) {
        let name = event.name();
        if let Err(e) = self.broadcaster.publish(Envelope::new(room_id, origin, event)).await {
            log::error!("Failed to relay {name} in room {room_id}: {e}");
        }
        log::debug!("{name}: {} {} entries in room {room_id}", action.name(), action.drawings().len());
        self.store.enqueue(room_id, PersistJob::UndoRedo(action));
    }
}
