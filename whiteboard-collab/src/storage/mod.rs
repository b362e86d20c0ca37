//! Persistent storage for room drawing logs.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   put / soft delete / transform   ┌──────────────┐
//! │ RoomWriters │ ─────────────────────────────────► │ HotLog       │
//! │ (per room)  │                                    │ (RocksDB)    │
//! └──────┬──────┘                                    └──────┬───────┘
//!        │ after each batch                                 │ list + purge
//!        ▼                                                  ▼
//! ┌─────────────┐   latest + write (immutable)       ┌──────────────┐
//! │ Compactor   │ ─────────────────────────────────► │ SnapshotStore│
//! └─────────────┘                                    │ {room}/{ts}  │
//!                                                    └──────────────┘
//! ```
//!
//! Both stores are synchronous: callers on the async path run them through
//! `tokio::task::spawn_blocking`. They only promise atomic single-key writes.

pub mod hot_log;
pub mod snapshot;

pub use hot_log::{RocksHotLog, StoreConfig};
pub use snapshot::{FsSnapshotStore, Snapshot, SnapshotConfig, SnapshotObject};

use crate::drawing::{Drawing, DrawingRecord};
use crate::error::{PersistenceError, StoreError};

/// Maximum number of keys a single physical-delete batch may carry.
pub const MAX_BATCH_SIZE: usize = 25;

/// Outcome of [`HotLog::put_batch`]: each put stands on its own.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub written: Vec<DrawingRecord>,
    /// `(drawing id if any, error)` for every put that failed
    pub failed: Vec<(Option<String>, PersistenceError)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of a chunked physical delete.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    /// Records physically removed
    pub deleted: usize,
    /// Size of each delete batch issued, in order
    pub batch_sizes: Vec<usize>,
    /// Drawing ids the backend rejected (not retried)
    pub unprocessed: Vec<String>,
    /// Drawing ids kept because they changed after being read
    pub retained: Vec<String>,
}

/// Size of a room's hot log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoomStats {
    /// Records currently in the hot log, tombstones included
    pub count: usize,
    /// Sum of the serialized (JSON) byte size of each record
    pub total_size: usize,
}

/// Room-partitioned, drawing-keyed store of live edit records.
pub trait HotLog: Send + Sync {
    /// Unconditional upsert. An existing record keeps its `created_at`.
    fn put(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, PersistenceError>;

    /// Independent puts; one failure does not undo the others.
    fn put_batch(&self, room_id: &str, drawings: &[Drawing]) -> BatchReport {
        let mut report = BatchReport::default();
        for drawing in drawings {
            match self.put(room_id, drawing) {
                Ok(record) => report.written.push(record),
                Err(e) => report.failed.push((drawing.id().map(str::to_string), e)),
            }
        }
        report
    }

    fn get(&self, room_id: &str, drawing_id: &str) -> Result<Option<DrawingRecord>, PersistenceError>;

    /// All records of a room in persisted (creation) order, tombstones included.
    fn list_by_room(&self, room_id: &str) -> Result<Vec<DrawingRecord>, PersistenceError>;

    /// Tombstone the drawing, creating it from the payload first if absent.
    fn soft_delete(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, StoreError>;

    /// Clear the tombstone, creating the drawing from the payload first if absent.
    fn restore(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, StoreError>;

    /// Full-field overwrite, creating the drawing from the payload if absent.
    fn apply_transform(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, StoreError>;

    /// Update only the supplied transform attributes, creating the drawing if absent.
    fn apply_transform_partial(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, StoreError>;

    /// Physically delete every record of a room in batches of at most [`MAX_BATCH_SIZE`].
    fn purge_room(&self, room_id: &str) -> Result<PurgeReport, PersistenceError>;

    /// Physically delete the given records unless their stored `updated_at`
    /// moved on since they were read.
    fn purge_if_unchanged(
        &self,
        room_id: &str,
        records: &[DrawingRecord],
    ) -> Result<PurgeReport, PersistenceError>;

    fn room_stats(&self, room_id: &str) -> Result<RoomStats, PersistenceError> {
        let records = self.list_by_room(room_id)?;
        let mut stats = RoomStats { count: records.len(), total_size: 0 };
        for record in &records {
            stats.total_size += serde_json::to_vec(record)
                .map_err(|e| PersistenceError::Serialization(e.to_string()))?
                .len();
        }
        Ok(stats)
    }
}

/// Write-once store of full-room backups.
pub trait SnapshotStore: Send + Sync {
    /// Write a new immutable snapshot; returns its object key.
    fn write_snapshot(&self, room_id: &str, records: &[DrawingRecord]) -> Result<String, PersistenceError>;

    /// Drawings of the most recently written snapshot, empty when there is
    /// none or it fails validation.
    fn latest_snapshot(&self, room_id: &str) -> Result<Vec<DrawingRecord>, PersistenceError>;

    /// Snapshot objects of a room, newest key first.
    fn list_snapshots(&self, room_id: &str) -> Result<Vec<SnapshotObject>, PersistenceError>;
}
