//! Cold snapshot store: write-once, timestamped full-room backups.
//!
//! Object layout inside the bucket directory:
//! ```text
//! <root>/
//! └── <room_id>/
//!     ├── 2025-03-01T10:15:02.118204Z.json   { roomId, timestamp, drawingsCount, drawings }
//!     └── 2025-03-01T10:42:40.905511Z.json
//! ```
//!
//! Objects are immutable: a body is written to a hidden temp file and then
//! hard-linked to its key, which fails instead of replacing an existing key.
//! The latest snapshot is the object with the greatest last-modified time.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

use super::SnapshotStore;
use crate::drawing::DrawingRecord;
use crate::error::{PersistenceError, SnapshotFormatError};

/// Snapshot store configuration.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Bucket root directory
    pub root: PathBuf,
    /// Most recent keys considered when looking for the latest snapshot
    pub max_listed: usize,
    /// fsync snapshot bodies before linking them in
    pub sync_writes: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("whiteboard_data/snapshots"),
            max_listed: 100,
            sync_writes: true,
        }
    }
}

impl SnapshotConfig {
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_listed: 100,
            sync_writes: false,
        }
    }
}

/// Snapshot body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub room_id: String,
    pub timestamp: String,
    pub drawings_count: usize,
    pub drawings: Vec<DrawingRecord>,
}

impl Snapshot {
    /// Parse and validate a snapshot body stored under `key`.
    pub fn parse(key: &str, body: &[u8]) -> Result<Self, SnapshotFormatError> {
        serde_json::from_slice(body).map_err(|e| SnapshotFormatError {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Borrowing twin of [`Snapshot`] used on the write path.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody<'a> {
    room_id: &'a str,
    timestamp: &'a str,
    drawings_count: usize,
    drawings: &'a [DrawingRecord],
}

/// A listed snapshot object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotObject {
    /// `{room_id}/{timestamp}.json`
    pub key: String,
    pub last_modified: SystemTime,
    pub size: u64,
}

/// Filesystem-backed object store for snapshots.
pub struct FsSnapshotStore {
    config: SnapshotConfig,
}

impl FsSnapshotStore {
    /// Open the bucket, creating the root directory if needed.
    pub fn open(config: SnapshotConfig) -> Result<Self, PersistenceError> {
        fs::create_dir_all(&config.root)?;
        log::info!("Snapshot store opened at {}", config.root.display());
        Ok(Self { config })
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Read and parse one snapshot object.
    pub fn load_snapshot(&self, key: &str) -> Result<Snapshot, PersistenceError> {
        let body = self.read_object(key)?;
        Snapshot::parse(key, &body).map_err(|e| PersistenceError::Deserialization(e.to_string()))
    }

    fn room_dir(&self, room_id: &str) -> Result<PathBuf, PersistenceError> {
        let invalid = room_id.is_empty()
            || room_id == "."
            || room_id == ".."
            || room_id.contains(['/', '\\', '\0']);
        if invalid {
            return Err(PersistenceError::InvalidKey(format!("room id {room_id:?} is not a valid key prefix")));
        }
        Ok(self.config.root.join(room_id))
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let (room_id, name) = key
            .split_once('/')
            .ok_or_else(|| PersistenceError::InvalidKey(key.to_string()))?;
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.room_dir(room_id)?.join(name))
    }

    fn read_object(&self, key: &str) -> Result<Vec<u8>, PersistenceError> {
        Ok(fs::read(self.object_path(key)?)?)
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn write_snapshot(&self, room_id: &str, records: &[DrawingRecord]) -> Result<String, PersistenceError> {
        let dir = self.room_dir(room_id)?;
        fs::create_dir_all(&dir)?;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let name = format!("{timestamp}.json");
        let key = format!("{room_id}/{name}");

        let body = serde_json::to_vec_pretty(&SnapshotBody {
            room_id,
            timestamp: &timestamp,
            drawings_count: records.len(),
            drawings: records,
        })
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;

        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            if self.config.sync_writes {
                file.sync_all()?;
            }
        }

        let linked = fs::hard_link(&tmp, dir.join(&name));
        if let Err(e) = fs::remove_file(&tmp) {
            log::warn!("Failed to remove temp snapshot {}: {e}", tmp.display());
        }
        match linked {
            Ok(()) => {
                log::info!("Snapshot saved: {key} ({} drawings)", records.len());
                Ok(key)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PersistenceError::AlreadyExists(key)),
            Err(e) => Err(e.into()),
        }
    }

    fn latest_snapshot(&self, room_id: &str) -> Result<Vec<DrawingRecord>, PersistenceError> {
        let objects = self.list_snapshots(room_id)?;
        let latest = objects
            .iter()
            .max_by(|a, b| a.last_modified.cmp(&b.last_modified).then_with(|| a.key.cmp(&b.key)));

        let Some(latest) = latest else {
            return Ok(Vec::new());
        };

        let body = self.read_object(&latest.key)?;
        match Snapshot::parse(&latest.key, &body) {
            Ok(snapshot) if snapshot.room_id == room_id => Ok(snapshot.drawings),
            Ok(snapshot) => {
                log::error!(
                    "Invalid snapshot data structure for {}: belongs to room {}",
                    latest.key,
                    snapshot.room_id
                );
                Ok(Vec::new())
            }
            Err(e) => {
                log::error!("{e}");
                Ok(Vec::new())
            }
        }
    }

    fn list_snapshots(&self, room_id: &str) -> Result<Vec<SnapshotObject>, PersistenceError> {
        let dir = self.room_dir(room_id)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            objects.push(SnapshotObject {
                key: format!("{room_id}/{name}"),
                last_modified: meta.modified()?,
                size: meta.len(),
            });
        }

        // ISO timestamps sort lexicographically
        objects.sort_by(|a, b| b.key.cmp(&a.key));
        objects.truncate(self.config.max_listed);
        Ok(objects)
    }
}
