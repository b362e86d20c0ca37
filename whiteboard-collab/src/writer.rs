//! Per-room sequential persistence.
//!
//! Broadcasts go out first; persistence is queued here and runs on one task
//! per room, in the order the jobs were queued:
//!
//! ```text
//! session ──enqueue──► mpsc ──► room writer task ──spawn_blocking──► HotLog
//!                                      │                              │
//!                                      └── after every write job ──► Compactor
//! ```
//!
//! A room's writes never interleave with its compaction, and a joiner's
//! state read queues behind every write accepted before it. Jobs outlive the
//! connection that queued them; a retired room's writer drains before a new
//! writer for the same room starts applying jobs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::compaction::{merge_drawings, CompactionOutcome, Compactor};
use crate::drawing::{Drawing, DrawingRecord, UndoRedoAction};
use crate::storage::{HotLog, SnapshotStore};
use crate::undo;

/// Work items for a room writer.
#[derive(Debug)]
pub enum PersistJob {
    /// Upsert each drawing
    Save(Vec<Drawing>),
    /// Soft-delete each drawing
    Remove(Vec<Drawing>),
    /// Partial update for move/resize entries, full overwrite otherwise
    Transform(Vec<Drawing>),
    /// Apply a client undo/redo batch
    UndoRedo(UndoRedoAction),
    /// Merged snapshot + hot log of the room, tombstones included
    LoadState(oneshot::Sender<Vec<DrawingRecord>>),
    /// Resolves once every earlier job has finished
    Flush(oneshot::Sender<()>),
}

impl PersistJob {
    fn name(&self) -> &'static str {
        match self {
            PersistJob::Save(_) => "save",
            PersistJob::Remove(_) => "remove",
            PersistJob::Transform(_) => "transform",
            PersistJob::UndoRedo(_) => "undo/redo",
            PersistJob::LoadState(_) => "load",
            PersistJob::Flush(_) => "flush",
        }
    }
}

/// Where sessions send a room's persistence work.
///
/// [`RoomWriters`] applies jobs in this process. `relay::RelayStore` ships
/// them to the relay hub so every server shares one copy of each room.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Queue a job behind every job already queued for the room.
    fn enqueue(&self, room_id: &str, job: PersistJob);

    /// Stop accepting jobs for a room. Already queued jobs still run.
    fn retire(&self, room_id: &str);

    /// Wait until every job queued for the room so far has been applied.
    async fn flush(&self, room_id: &str) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(room_id, PersistJob::Flush(tx));
        let _ = rx.await;
    }

    /// Current room state: latest snapshot merged with the hot log.
    /// Reads as empty when the state cannot be produced.
    async fn load_state(&self, room_id: &str) -> Vec<DrawingRecord> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(room_id, PersistJob::LoadState(tx));
        rx.await.unwrap_or_default()
    }
}

struct RoomQueue {
    tx: mpsc::UnboundedSender<PersistJob>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Queues {
    active: HashMap<String, RoomQueue>,
    /// Retired writers still draining their backlog
    draining: HashMap<String, JoinHandle<()>>,
}

/// Registry of room writer tasks.
#[derive(Clone)]
pub struct RoomWriters {
    compactor: Arc<Compactor>,
    queues: Arc<Mutex<Queues>>,
}

impl RoomWriters {
    pub fn new(compactor: Arc<Compactor>) -> Self {
        Self {
            compactor,
            queues: Arc::new(Mutex::new(Queues::default())),
        }
    }

    pub fn compactor(&self) -> &Arc<Compactor> {
        &self.compactor
    }

    pub fn active_rooms(&self) -> usize {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner).active.len()
    }
}

#[async_trait]
impl RoomStore for RoomWriters {
    /// Starts the room's writer task if needed.
    /// Must be called from within a tokio runtime.
    fn enqueue(&self, room_id: &str, job: PersistJob) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);

        let job = match queues.active.get(room_id) {
            Some(queue) => match queue.tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Fresh receiver is alive, the send cannot fail
        let _ = tx.send(job);
        let previous = queues.draining.remove(room_id);
        let task = tokio::spawn(run_room_writer(room_id.to_string(), rx, self.compactor.clone(), previous));
        queues.active.insert(room_id.to_string(), RoomQueue { tx, task });
    }

    fn retire(&self, room_id: &str) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.draining.retain(|_, task| !task.is_finished());
        if let Some(queue) = queues.active.remove(room_id) {
            // Dropping the sender lets the task exit once its backlog is done
            drop(queue.tx);
            queues.draining.insert(room_id.to_string(), queue.task);
            log::debug!("Retired writer for room {room_id}");
        }
    }
}

async fn run_room_writer(
    room_id: String,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
    compactor: Arc<Compactor>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    log::debug!("Writer started for room {room_id}");

    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Flush(done) => {
                let _ = done.send(());
            }
            PersistJob::LoadState(reply) => {
                let (room, compactor) = (room_id.clone(), compactor.clone());
                match tokio::task::spawn_blocking(move || load_state(&room, &compactor)).await {
                    Ok(state) => {
                        let _ = reply.send(state);
                    }
                    Err(e) => log::error!("State load task for room {room_id} failed: {e}"),
                }
            }
            job => {
                let name = job.name();
                let (room, compactor) = (room_id.clone(), compactor.clone());
                let applied = tokio::task::spawn_blocking(move || {
                    apply(compactor.hot_log().as_ref(), &room, job);
                    compactor.check_and_compact(&room)
                })
                .await;
                match applied {
                    Ok(CompactionOutcome::Compacted { key, .. }) => {
                        log::debug!("Room {room_id} compacted into {key} after {name}");
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("{name} job for room {room_id} panicked: {e}"),
                }
            }
        }
    }

    log::debug!("Writer stopped for room {room_id}");
}

/// Apply one write job. Every failure is logged, never returned.
fn apply(hot_log: &dyn HotLog, room_id: &str, job: PersistJob) {
    match job {
        PersistJob::Save(drawings) => {
            let report = hot_log.put_batch(room_id, &drawings);
            for (id, e) in report.failed {
                log::error!("Failed to save drawing {} in room {room_id}: {e}", id.as_deref().unwrap_or("<new>"));
            }
        }
        PersistJob::Remove(drawings) => {
            for drawing in &drawings {
                if let Err(e) = hot_log.soft_delete(room_id, drawing) {
                    log::error!("Failed to delete drawing in room {room_id}: {e}");
                }
            }
        }
        PersistJob::Transform(drawings) => {
            for drawing in &drawings {
                let result = if drawing.is_transform_only() {
                    hot_log.apply_transform_partial(room_id, drawing)
                } else {
                    hot_log.apply_transform(room_id, drawing)
                };
                if let Err(e) = result {
                    log::error!("Failed to transform drawing in room {room_id}: {e}");
                }
            }
        }
        PersistJob::UndoRedo(action) => match undo::apply(hot_log, room_id, &action) {
            Ok(report) => {
                for (id, e) in &report.failed {
                    log::error!("Failed to {} drawing {id} in room {room_id}: {e}", action.name());
                }
            }
            Err(e) => log::warn!("Rejected {} batch for room {room_id}: {e}", action.name()),
        },
        PersistJob::LoadState(_) | PersistJob::Flush(_) => {}
    }
}

/// Merged state of a room. A failing tier reads as empty.
fn load_state(room_id: &str, compactor: &Compactor) -> Vec<DrawingRecord> {
    let previous = read_or_empty(room_id, "snapshot", || compactor.snapshots().latest_snapshot(room_id));
    let current = read_or_empty(room_id, "hot log", || compactor.hot_log().list_by_room(room_id));
    merge_drawings(previous, current)
}

fn read_or_empty<F>(room_id: &str, tier: &str, read: F) -> Vec<DrawingRecord>
where
    F: FnOnce() -> Result<Vec<DrawingRecord>, crate::error::PersistenceError>,
{
    read().unwrap_or_else(|e| {
        log::error!("Failed to read {tier} for room {room_id}: {e}");
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactionPolicy;
    use crate::storage::{FsSnapshotStore, RocksHotLog, SnapshotConfig, StoreConfig};
    use tempfile::TempDir;

    fn writers(policy: CompactionPolicy) -> (TempDir, Arc<RocksHotLog>, Arc<FsSnapshotStore>, RoomWriters) {
        let dir = tempfile::tempdir().unwrap();
        let hot = Arc::new(RocksHotLog::open(StoreConfig::for_testing(dir.path().join("hot"))).unwrap());
        let cold = Arc::new(FsSnapshotStore::open(SnapshotConfig::for_testing(dir.path().join("cold"))).unwrap());
        let compactor = Arc::new(Compactor::new(hot.clone(), cold.clone(), policy));
        (dir, hot, cold, RoomWriters::new(compactor))
    }

    fn pen(id: &str) -> Drawing {
        Drawing {
            id: Some(id.into()),
            kind: "pen".into(),
            points: vec![1.0, 1.0, 2.0, 2.0],
            stroke: "#111".into(),
            stroke_width: 3.0,
            ..Drawing::default()
        }
    }

    #[tokio::test]
    async fn test_jobs_apply_in_order() {
        let (_dir, hot, _cold, writers) = writers(CompactionPolicy::default());

        writers.enqueue("r1", PersistJob::Save(vec![pen("a")]));
        writers.enqueue("r1", PersistJob::Remove(vec![pen("a")]));
        writers.enqueue("r1", PersistJob::UndoRedo(UndoRedoAction::Restore(vec![pen("a")])));
        writers.flush("r1").await;

        let record = hot.get("r1", "a").unwrap().unwrap();
        assert!(record.is_live());
    }

    #[tokio::test]
    async fn test_transform_routing() {
        let (_dir, hot, _cold, writers) = writers(CompactionPolicy::default());
        let mut styled = pen("a");
        styled.x = Some(5.0);
        styled.line_cap = Some("round".into());
        writers.enqueue("r1", PersistJob::Save(vec![styled]));

        let move_only = Drawing { id: Some("a".into()), y: Some(9.0), ..Drawing::default() };
        writers.enqueue("r1", PersistJob::Transform(vec![move_only]));
        writers.flush("r1").await;

        let record = hot.get("r1", "a").unwrap().unwrap();
        assert_eq!(record.x, Some(5.0));
        assert_eq!(record.y, Some(9.0));
        assert_eq!(record.line_cap.as_deref(), Some("round"));

        let full = Drawing { kind: "rect".into(), ..pen("a") };
        writers.enqueue("r1", PersistJob::Transform(vec![full]));
        writers.flush("r1").await;

        let record = hot.get("r1", "a").unwrap().unwrap();
        assert_eq!(record.kind, "rect");
        assert!(record.x.is_none());
        assert!(record.line_cap.is_none());
    }

    #[tokio::test]
    async fn test_load_state_merges_tiers() {
        let (_dir, _hot, _cold, writers) = writers(CompactionPolicy { max_records: 2, max_bytes: usize::MAX });

        writers.enqueue("r1", PersistJob::Save(vec![pen("a"), pen("b")]));
        writers.enqueue("r1", PersistJob::Save(vec![pen("c")]));
        writers.enqueue("r1", PersistJob::Remove(vec![pen("b")]));

        let state = writers.load_state("r1").await;
        let view: Vec<(&str, bool)> = state.iter().map(|r| (r.drawing_id.as_str(), r.is_live())).collect();
        assert_eq!(view, vec![("a", true), ("b", false), ("c", true)]);
    }

    #[tokio::test]
    async fn test_compaction_runs_after_writes() {
        let (_dir, hot, cold, writers) = writers(CompactionPolicy { max_records: 3, max_bytes: usize::MAX });

        writers.enqueue("r1", PersistJob::Save(vec![pen("a"), pen("b"), pen("c")]));
        writers.flush("r1").await;

        assert!(hot.list_by_room("r1").unwrap().is_empty());
        assert_eq!(cold.list_snapshots("r1").unwrap().len(), 1);
        assert_eq!(writers.compactor().stats().compactions, 1);
    }

    #[tokio::test]
    async fn test_invalid_undo_batch_is_dropped() {
        let (_dir, hot, _cold, writers) = writers(CompactionPolicy::default());
        writers.enqueue("r1", PersistJob::Save(vec![pen("a")]));
        let batch = UndoRedoAction::Delete(vec![pen("a"), Drawing::default()]);
        writers.enqueue("r1", PersistJob::UndoRedo(batch));
        writers.flush("r1").await;

        assert!(hot.get("r1", "a").unwrap().unwrap().is_live());
    }

    #[tokio::test]
    async fn test_retire_and_restart() {
        let (_dir, hot, _cold, writers) = writers(CompactionPolicy::default());
        writers.enqueue("r1", PersistJob::Save(vec![pen("a")]));
        assert_eq!(writers.active_rooms(), 1);

        // Backlog of the retired writer lands before the new writer's jobs
        writers.retire("r1");
        assert_eq!(writers.active_rooms(), 0);

        writers.enqueue("r1", PersistJob::Save(vec![pen("b")]));
        writers.flush("r1").await;
        let ids: Vec<String> = hot.list_by_room("r1").unwrap().into_iter().map(|r| r.drawing_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
