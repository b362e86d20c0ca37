//! Integration tests for the hot log / cold snapshot lifecycle.
//!
//! Sessions are driven directly (no sockets) so every assertion can look
//! at both storage tiers after the room writer has drained.

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use whiteboard_collab::drawing::Drawing;
use whiteboard_collab::error::{PersistenceError, StoreError};
use whiteboard_collab::protocol::{DrawingsPayload, JoinPayload};
use whiteboard_collab::storage::{PurgeReport, RoomStats};
use whiteboard_collab::{
    ClientEvent, CompactionPolicy, DrawingRecord, FsSnapshotStore, HotLog, LocalBroadcaster, RocksHotLog, RoomStore,
    ServerEvent, SnapshotConfig, SnapshotStore, StoreConfig, WhiteboardService,
};

struct Stores {
    hot_log: Arc<RocksHotLog>,
    snapshots: Arc<FsSnapshotStore>,
}

fn open_stores(dir: &Path) -> Stores {
    Stores {
        hot_log: Arc::new(RocksHotLog::open(StoreConfig::for_testing(dir.join("hot"))).unwrap()),
        snapshots: Arc::new(FsSnapshotStore::open(SnapshotConfig::for_testing(dir.join("cold"))).unwrap()),
    }
}

fn service(stores: &Stores) -> Arc<WhiteboardService> {
    WhiteboardService::new(
        stores.hot_log.clone(),
        stores.snapshots.clone(),
        Arc::new(LocalBroadcaster::new(64)),
        CompactionPolicy::default(),
    )
}

fn pen(id: &str) -> Drawing {
    Drawing {
        id: Some(id.into()),
        kind: "pen".into(),
        points: vec![10.0, 10.0, 20.0, 20.0],
        stroke: "#000000".into(),
        stroke_width: 2.0,
        ..Drawing::default()
    }
}

fn pens(prefix: &str, n: usize) -> Vec<Drawing> {
    (0..n).map(|i| pen(&format!("{prefix}-{i:03}"))).collect()
}

fn drawing_event(room: &str, drawings: Vec<Drawing>) -> ClientEvent {
    ClientEvent::Drawing(DrawingsPayload { room_id: room.into(), drawings })
}

fn join_event(room: &str) -> ClientEvent {
    ClientEvent::Join(JoinPayload { room_id: room.into() })
}

#[tokio::test]
async fn test_hundred_drawings_compact_into_one_snapshot() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(dir.path());
    let service = service(&stores);
    let mut session = service.open_session();

    session.handle(join_event("r2")).await;
    session.handle(drawing_event("r2", pens("d", 100))).await;
    service.flush("r2").await;

    let snapshots = stores.snapshots.list_snapshots("r2").unwrap();
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].key.starts_with("r2/"));
    assert_eq!(stores.snapshots.latest_snapshot("r2").unwrap().len(), 100);
    assert!(stores.hot_log.list_by_room("r2").unwrap().is_empty());
    assert_eq!(service.compactor().unwrap().stats().compactions, 1);

    // Nothing lost from the joiner's point of view
    assert_eq!(service.current_state("r2").await.len(), 100);
}

#[tokio::test]
async fn test_ninety_nine_drawings_stay_hot() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(dir.path());
    let service = service(&stores);
    let mut session = service.open_session();

    session.handle(join_event("r3")).await;
    session.handle(drawing_event("r3", pens("d", 99))).await;
    service.flush("r3").await;

    assert!(stores.snapshots.list_snapshots("r3").unwrap().is_empty());
    assert_eq!(stores.hot_log.list_by_room("r3").unwrap().len(), 99);
    assert_eq!(service.compactor().unwrap().stats().compactions, 0);
}

#[tokio::test]
async fn test_hundred_single_drawing_events_compact_once() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(dir.path());
    let service = service(&stores);
    let mut session = service.open_session();

    session.handle(join_event("r4")).await;
    for drawing in pens("d", 99) {
        session.handle(drawing_event("r4", vec![drawing])).await;
    }
    service.flush("r4").await;

    assert!(stores.snapshots.list_snapshots("r4").unwrap().is_empty());
    assert_eq!(stores.hot_log.list_by_room("r4").unwrap().len(), 99);
    assert_eq!(service.compactor().unwrap().stats().compactions, 0);

    session.handle(drawing_event("r4", vec![pen("d-099")])).await;
    service.flush("r4").await;

    assert_eq!(stores.snapshots.list_snapshots("r4").unwrap().len(), 1);
    assert_eq!(stores.snapshots.latest_snapshot("r4").unwrap().len(), 100);
    assert!(stores.hot_log.list_by_room("r4").unwrap().is_empty());
    assert_eq!(service.compactor().unwrap().stats().compactions, 1);
    assert_eq!(service.current_state("r4").await.len(), 100);
}

#[tokio::test]
async fn test_state_spans_snapshot_and_hot_log() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(dir.path());
    let service = service(&stores);
    let mut session = service.open_session();

    session.handle(join_event("r1")).await;
    session.handle(drawing_event("r1", pens("old", 100))).await;
    session.handle(drawing_event("r1", vec![pen("new-1"), pen("new-2")])).await;
    session
        .handle(ClientEvent::Remove(DrawingsPayload {
            room_id: "r1".into(),
            drawings: vec![pen("old-000")],
        }))
        .await;
    service.flush("r1").await;

    assert_eq!(stores.snapshots.list_snapshots("r1").unwrap().len(), 1);
    assert_eq!(stores.hot_log.list_by_room("r1").unwrap().len(), 3);

    let state = service.current_state("r1").await;
    assert_eq!(state.len(), 101);
    assert_eq!(state[0].id.as_deref(), Some("old-001"));
    assert_eq!(state[99].id.as_deref(), Some("new-1"));
    assert!(state.iter().all(|d| d.id.as_deref() != Some("old-000")));
}

#[tokio::test]
async fn test_second_compaction_carries_previous_snapshot() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(dir.path());
    let service = service(&stores);
    let mut session = service.open_session();

    session.handle(join_event("r1")).await;
    session.handle(drawing_event("r1", pens("a", 100))).await;
    session.handle(drawing_event("r1", pens("b", 100))).await;
    service.flush("r1").await;

    let snapshots = stores.snapshots.list_snapshots("r1").unwrap();
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots[0].key > snapshots[1].key);
    assert_eq!(stores.snapshots.latest_snapshot("r1").unwrap().len(), 200);
    assert_eq!(service.current_state("r1").await.len(), 200);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let stores = open_stores(dir.path());
        let service = service(&stores);
        let mut session = service.open_session();
        session.handle(join_event("r1")).await;
        session.handle(drawing_event("r1", pens("cold", 100))).await;
        session.handle(drawing_event("r1", vec![pen("hot")])).await;
        session.disconnect().await;
        service.flush("r1").await;
        service.store().retire("r1");
    }

    // Let the retired writer release its store handles
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let stores = open_stores(dir.path());
    let service = service(&stores);
    let mut session = service.open_session();
    let replies = session.handle(join_event("r1")).await;
    match &replies[..] {
        [ServerEvent::RoomData(drawings)] => {
            assert_eq!(drawings.len(), 101);
            assert_eq!(drawings.last().and_then(|d| d.id.as_deref()), Some("hot"));
        }
        other => panic!("expected a single roomData reply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_snapshot_reads_as_hot_log_only() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(dir.path());
    stores.hot_log.put("r1", &pen("hot")).unwrap();

    let room_dir = dir.path().join("cold").join("r1");
    std::fs::create_dir_all(&room_dir).unwrap();
    std::fs::write(room_dir.join("2030-01-01T00:00:00.000000Z.json"), br#"{"roomId":"r1"}"#).unwrap();

    let service = service(&stores);
    let state = service.current_state("r1").await;
    assert_eq!(state, vec![pen("hot")]);
}

// ─── Storage outage ───────────────────────────────────────────────────

/// Hot log whose backend is unreachable.
struct UnreachableHotLog;

fn unreachable() -> PersistenceError {
    PersistenceError::Database("connection refused".into())
}

impl HotLog for UnreachableHotLog {
    fn put(&self, _: &str, _: &Drawing) -> Result<DrawingRecord, PersistenceError> {
        Err(unreachable())
    }
    fn get(&self, _: &str, _: &str) -> Result<Option<DrawingRecord>, PersistenceError> {
        Err(unreachable())
    }
    fn list_by_room(&self, _: &str) -> Result<Vec<DrawingRecord>, PersistenceError> {
        Err(unreachable())
    }
    fn soft_delete(&self, _: &str, _: &Drawing) -> Result<DrawingRecord, StoreError> {
        Err(unreachable().into())
    }
    fn restore(&self, _: &str, _: &Drawing) -> Result<DrawingRecord, StoreError> {
        Err(unreachable().into())
    }
    fn apply_transform(&self, _: &str, _: &Drawing) -> Result<DrawingRecord, StoreError> {
        Err(unreachable().into())
    }
    fn apply_transform_partial(&self, _: &str, _: &Drawing) -> Result<DrawingRecord, StoreError> {
        Err(unreachable().into())
    }
    fn purge_room(&self, _: &str) -> Result<PurgeReport, PersistenceError> {
        Err(unreachable())
    }
    fn purge_if_unchanged(&self, _: &str, _: &[DrawingRecord]) -> Result<PurgeReport, PersistenceError> {
        Err(unreachable())
    }
    fn room_stats(&self, _: &str) -> Result<RoomStats, PersistenceError> {
        Err(unreachable())
    }
}

#[tokio::test]
async fn test_edits_fan_out_while_storage_is_down() {
    let dir = TempDir::new().unwrap();
    let snapshots = Arc::new(FsSnapshotStore::open(SnapshotConfig::for_testing(dir.path().join("cold"))).unwrap());
    let service = WhiteboardService::new(
        Arc::new(UnreachableHotLog),
        snapshots,
        Arc::new(LocalBroadcaster::new(64)),
        CompactionPolicy::default(),
    );

    let mut alice = service.open_session();
    let mut bob = service.open_session();
    assert_eq!(alice.handle(join_event("r1")).await, vec![ServerEvent::RoomData(Vec::new())]);
    bob.handle(join_event("r1")).await;
    let _ = alice.next_event().await;

    let payload = DrawingsPayload { room_id: "r1".into(), drawings: vec![pen("d1")] };
    alice.handle(ClientEvent::Drawing(payload.clone())).await;
    assert_eq!(bob.next_event().await, Some(ServerEvent::Drawing(payload)));

    service.flush("r1").await;
    assert!(service.current_state("r1").await.is_empty());
    assert_eq!(service.compactor().unwrap().stats().compactions, 0);
}
