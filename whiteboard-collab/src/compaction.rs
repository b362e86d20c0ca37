//! Hot-to-cold compaction.
//!
//! A room's hot log grows with every edit. Once it holds
//! [`CompactionPolicy::max_records`] records, or their JSON encoding reaches
//! [`CompactionPolicy::max_bytes`], the compactor folds it into the cold tier:
//!
//! ```text
//!   latest snapshot ──┐
//!                     ├─ merge (hot wins) ─► new snapshot ─► purge hot records
//!   hot log records ──┘                                     (25 per batch)
//! ```
//!
//! The purge only removes records that still carry the `updated_at` read at
//! merge time, so an edit landing mid-compaction stays in the hot log and is
//! picked up by the next cycle.
//!
//! Compaction failures are logged and counted. They never reach the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::drawing::DrawingRecord;
use crate::error::PersistenceError;
use crate::storage::{HotLog, PurgeReport, RoomStats, SnapshotStore};

/// Thresholds that trigger a compaction. Either one suffices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub max_records: usize,
    pub max_bytes: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            max_records: 100,
            max_bytes: 1024 * 1024,
        }
    }
}

impl CompactionPolicy {
    pub fn should_compact(&self, stats: &RoomStats) -> bool {
        stats.count >= self.max_records || stats.total_size >= self.max_bytes
    }
}

/// What a compaction check did.
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    /// Below both thresholds
    Skipped(RoomStats),
    /// A snapshot was written and the hot log purged
    Compacted {
        key: String,
        drawings: usize,
        purge: PurgeReport,
    },
    /// Logged and swallowed
    Failed(String),
}

/// Counters for monitoring compaction health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub checks: u64,
    pub compactions: u64,
    pub failures: u64,
}

#[derive(Default)]
struct AtomicCompactionStats {
    checks: AtomicU64,
    compactions: AtomicU64,
    failures: AtomicU64,
}

/// Moves hot log contents into immutable snapshots.
pub struct Compactor {
    hot_log: Arc<dyn HotLog>,
    snapshots: Arc<dyn SnapshotStore>,
    policy: CompactionPolicy,
    stats: AtomicCompactionStats,
}

impl Compactor {
    pub fn new(hot_log: Arc<dyn HotLog>, snapshots: Arc<dyn SnapshotStore>, policy: CompactionPolicy) -> Self {
        Self {
            hot_log,
            snapshots,
            policy,
            stats: AtomicCompactionStats::default(),
        }
    }

    pub fn policy(&self) -> CompactionPolicy {
        self.policy
    }

    pub fn hot_log(&self) -> &Arc<dyn HotLog> {
        &self.hot_log
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            checks: self.stats.checks.load(Ordering::Relaxed),
            compactions: self.stats.compactions.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    /// Compact the room if its hot log crossed a threshold.
    ///
    /// Blocking. Callers on the async path go through `spawn_blocking`.
    pub fn check_and_compact(&self, room_id: &str) -> CompactionOutcome {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        let stats = match self.hot_log.room_stats(room_id) {
            Ok(stats) => stats,
            Err(e) => return self.fail(room_id, e),
        };
        if !self.policy.should_compact(&stats) {
            return CompactionOutcome::Skipped(stats);
        }

        log::info!(
            "Compacting room {room_id}: {} records, {} bytes",
            stats.count,
            stats.total_size
        );
        match self.compact(room_id) {
            Ok(outcome) => {
                self.stats.compactions.fetch_add(1, Ordering::Relaxed);
                outcome
            }
            Err(e) => self.fail(room_id, e),
        }
    }

    /// Unconditionally fold the hot log into a new snapshot.
    pub fn compact(&self, room_id: &str) -> Result<CompactionOutcome, PersistenceError> {
        let previous = self.snapshots.latest_snapshot(room_id)?;
        let current = self.hot_log.list_by_room(room_id)?;
        let merged = merge_drawings(previous, current.clone());

        let key = self.snapshots.write_snapshot(room_id, &merged)?;
        let purge = self.hot_log.purge_if_unchanged(room_id, &current)?;

        if !purge.unprocessed.is_empty() {
            log::error!(
                "Room {room_id}: {} hot records were not purged after snapshot {key}: {:?}",
                purge.unprocessed.len(),
                purge.unprocessed
            );
        }
        if !purge.retained.is_empty() {
            log::debug!(
                "Room {room_id}: {} records changed during compaction and stay hot",
                purge.retained.len()
            );
        }
        log::info!(
            "Room {room_id} compacted into {key}: {} drawings, {} hot records purged",
            merged.len(),
            purge.deleted
        );

        Ok(CompactionOutcome::Compacted {
            key,
            drawings: merged.len(),
            purge,
        })
    }

    fn fail(&self, room_id: &str, error: PersistenceError) -> CompactionOutcome {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        log::error!("Error checking snapshot creation for room {room_id}: {error}");
        CompactionOutcome::Failed(error.to_string())
    }
}

/// Union of a snapshot and the hot log, keyed by drawing id.
///
/// Snapshot order comes first; a hot record replaces its snapshot twin in
/// place, and hot-only records are appended in their own order. Tombstones
/// are carried like any other record.
pub fn merge_drawings(previous: Vec<DrawingRecord>, current: Vec<DrawingRecord>) -> Vec<DrawingRecord> {
    let mut merged: Vec<DrawingRecord> = Vec::with_capacity(previous.len() + current.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(previous.len() + current.len());

    for record in previous.into_iter().chain(current) {
        match index.get(&record.drawing_id) {
            Some(&slot) => merged[slot] = record,
            None => {
                index.insert(record.drawing_id.clone(), merged.len());
                merged.push(record);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drawing::{to_record, Drawing};
    use crate::storage::{FsSnapshotStore, RocksHotLog, SnapshotConfig, SnapshotObject, StoreConfig};
    use tempfile::TempDir;

    fn drawing(id: &str) -> Drawing {
        Drawing {
            id: Some(id.into()),
            kind: "pen".into(),
            points: vec![0.0, 0.0, 3.0, 4.0],
            stroke: "#000".into(),
            stroke_width: 2.0,
            ..Drawing::default()
        }
    }

    fn record(id: &str, stroke: &str) -> DrawingRecord {
        to_record("r", &Drawing { stroke: stroke.into(), ..drawing(id) })
    }

    struct Fixture {
        _dir: TempDir,
        hot: Arc<RocksHotLog>,
        cold: Arc<FsSnapshotStore>,
        compactor: Compactor,
    }

    fn fixture(policy: CompactionPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let hot = Arc::new(RocksHotLog::open(StoreConfig::for_testing(dir.path().join("hot"))).unwrap());
        let cold = Arc::new(FsSnapshotStore::open(SnapshotConfig::for_testing(dir.path().join("cold"))).unwrap());
        let compactor = Compactor::new(hot.clone(), cold.clone(), policy);
        Fixture { _dir: dir, hot, cold, compactor }
    }

    #[test]
    fn test_policy_thresholds() {
        let policy = CompactionPolicy::default();
        assert!(!policy.should_compact(&RoomStats { count: 99, total_size: 1024 * 1024 - 1 }));
        assert!(policy.should_compact(&RoomStats { count: 100, total_size: 0 }));
        assert!(policy.should_compact(&RoomStats { count: 1, total_size: 1024 * 1024 }));
    }

    #[test]
    fn test_merge_current_overrides_previous() {
        let previous = vec![record("a", "old"), record("b", "old")];
        let current = vec![record("c", "new"), record("a", "new")];

        let merged = merge_drawings(previous, current);
        let view: Vec<(&str, &str)> = merged
            .iter()
            .map(|r| (r.drawing_id.as_str(), r.stroke.as_str()))
            .collect();
        assert_eq!(view, vec![("a", "new"), ("b", "old"), ("c", "new")]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let previous = vec![record("a", "1"), record("b", "1")];
        let current = vec![record("b", "2")];

        let once = merge_drawings(previous.clone(), current.clone());
        let twice = merge_drawings(once.clone(), current);
        assert_eq!(once, twice);
        assert!(merge_drawings(Vec::new(), Vec::new()).is_empty());
    }

    #[test]
    fn test_merge_keeps_tombstones() {
        let mut deleted = record("a", "1");
        deleted.mark_deleted(chrono::Utc::now());
        let merged = merge_drawings(vec![record("a", "1")], vec![deleted]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_deleted);
    }

    #[test]
    fn test_ninety_nine_records_do_not_compact() {
        let f = fixture(CompactionPolicy::default());
        for i in 0..99 {
            f.hot.put("r2", &drawing(&format!("d{i}"))).unwrap();
        }

        assert!(matches!(
            f.compactor.check_and_compact("r2"),
            CompactionOutcome::Skipped(RoomStats { count: 99, .. })
        ));
        assert!(f.cold.list_snapshots("r2").unwrap().is_empty());
        assert_eq!(f.hot.list_by_room("r2").unwrap().len(), 99);
    }

    #[test]
    fn test_hundred_records_compact_once() {
        let f = fixture(CompactionPolicy::default());
        for i in 0..100 {
            f.hot.put("r2", &drawing(&format!("d{i}"))).unwrap();
        }

        let outcome = f.compactor.check_and_compact("r2");
        let CompactionOutcome::Compacted { key, drawings, purge } = outcome else {
            panic!("expected compaction, got {outcome:?}");
        };
        assert_eq!(drawings, 100);
        assert_eq!(purge.deleted, 100);
        assert_eq!(purge.batch_sizes, vec![25, 25, 25, 25]);

        assert!(f.hot.list_by_room("r2").unwrap().is_empty());
        let listed = f.cold.list_snapshots("r2").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key);
        assert_eq!(f.cold.latest_snapshot("r2").unwrap().len(), 100);

        assert!(matches!(f.compactor.check_and_compact("r2"), CompactionOutcome::Skipped(_)));
        assert_eq!(
            f.compactor.stats(),
            CompactionStats { checks: 2, compactions: 1, failures: 0 }
        );
    }

    #[test]
    fn test_byte_threshold_triggers() {
        let f = fixture(CompactionPolicy { max_records: 100, max_bytes: 2048 });
        let big = Drawing { points: vec![1.5; 800], ..drawing("big") };
        f.hot.put("r", &big).unwrap();

        assert!(matches!(f.compactor.check_and_compact("r"), CompactionOutcome::Compacted { .. }));
    }

    #[test]
    fn test_second_cycle_merges_with_previous_snapshot() {
        let f = fixture(CompactionPolicy { max_records: 2, max_bytes: usize::MAX });
        f.hot.put("r", &drawing("a")).unwrap();
        f.hot.put("r", &drawing("b")).unwrap();
        f.compactor.check_and_compact("r");

        std::thread::sleep(std::time::Duration::from_millis(10));
        f.hot.soft_delete("r", &drawing("a")).unwrap();
        f.hot.put("r", &drawing("c")).unwrap();
        f.compactor.check_and_compact("r");

        let latest = f.cold.latest_snapshot("r").unwrap();
        let view: Vec<(&str, bool)> = latest.iter().map(|r| (r.drawing_id.as_str(), r.is_deleted)).collect();
        assert_eq!(view, vec![("a", true), ("b", false), ("c", false)]);
        assert_eq!(f.cold.list_snapshots("r").unwrap().len(), 2);
    }

    struct BrokenSnapshots;

    impl SnapshotStore for BrokenSnapshots {
        fn write_snapshot(&self, _: &str, _: &[DrawingRecord]) -> Result<String, PersistenceError> {
            Err(PersistenceError::Io("bucket unreachable".into()))
        }
        fn latest_snapshot(&self, _: &str) -> Result<Vec<DrawingRecord>, PersistenceError> {
            Ok(Vec::new())
        }
        fn list_snapshots(&self, _: &str) -> Result<Vec<SnapshotObject>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_failed_snapshot_write_keeps_hot_log() {
        let dir = tempfile::tempdir().unwrap();
        let hot = Arc::new(RocksHotLog::open(StoreConfig::for_testing(dir.path())).unwrap());
        let compactor = Compactor::new(
            hot.clone(),
            Arc::new(BrokenSnapshots),
            CompactionPolicy { max_records: 1, max_bytes: usize::MAX },
        );
        hot.put("r", &drawing("a")).unwrap();

        assert!(matches!(compactor.check_and_compact("r"), CompactionOutcome::Failed(_)));
        assert_eq!(hot.list_by_room("r").unwrap().len(), 1);
        assert_eq!(compactor.stats().failures, 1);
    }
}
