//! RocksDB-backed hot log of live drawing records.
//!
//! Column family `drawings`:
//! ```text
//! key   = <room_len:u16 BE><room_id bytes><drawing_id bytes>
//! value = LZ4( JSON(DrawingRecord) )
//! ```
//!
//! The length-prefixed room id makes every room a contiguous key range, so
//! listing and purging a room is a single forward prefix scan.
//!
//! Read-modify-write operations (soft delete, restore, transforms, puts that
//! keep `created_at`) and the conditional purge run under one store-wide
//! write lock, so "check existence, then create or update" cannot interleave
//! with another writer in this process.

use chrono::Utc;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{HotLog, PurgeReport, RoomStats, MAX_BATCH_SIZE};
use crate::drawing::{self, Drawing, DrawingRecord};
use crate::error::{PersistenceError, StoreError};

const CF_DRAWINGS: &str = "drawings";

/// Hot log store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("whiteboard_data/hot_log"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB hot log.
pub struct RocksHotLog {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl RocksHotLog {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);

        let mut cf_opts = Options::default();
        cf_opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 blocks
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.set_write_buffer_size(config.write_buffer_size);
        cf_opts.set_max_write_buffer_number(4);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_DRAWINGS, cf_opts)],
        )?;

        log::info!("Hot log opened at {}", config.path.display());
        Ok(Self { db, config, write_lock: Mutex::new(()) })
    }

    /// Database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(CF_DRAWINGS)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{CF_DRAWINGS}' not found")))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn room_prefix(room_id: &str) -> Result<Vec<u8>, PersistenceError> {
        let len = u16::try_from(room_id.len())
            .map_err(|_| PersistenceError::InvalidKey(format!("room id too long ({} bytes)", room_id.len())))?;
        let mut prefix = Vec::with_capacity(2 + room_id.len());
        prefix.extend_from_slice(&len.to_be_bytes());
        prefix.extend_from_slice(room_id.as_bytes());
        Ok(prefix)
    }

    fn record_key(room_id: &str, drawing_id: &str) -> Result<Vec<u8>, PersistenceError> {
        let mut key = Self::room_prefix(room_id)?;
        key.extend_from_slice(drawing_id.as_bytes());
        Ok(key)
    }

    fn encode(record: &DrawingRecord) -> Result<Vec<u8>, PersistenceError> {
        let json = serde_json::to_vec(record).map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    /// Returns the record and its uncompressed JSON size.
    fn decode(value: &[u8]) -> Result<(DrawingRecord, usize), PersistenceError> {
        let json = lz4_flex::decompress_size_prepended(value)
            .map_err(|e| PersistenceError::Compression(e.to_string()))?;
        let record = serde_json::from_slice(&json).map_err(|e| PersistenceError::Deserialization(e.to_string()))?;
        Ok((record, json.len()))
    }

    fn write_record(&self, record: &DrawingRecord) -> Result<(), PersistenceError> {
        let cf = self.cf()?;
        let key = Self::record_key(&record.room_id, &record.drawing_id)?;
        self.db.put_cf_opt(cf, key, Self::encode(record)?, &self.write_options())?;
        Ok(())
    }

    /// Scan a room's key range: `(key, record, json size)` in key order.
    fn scan_room(&self, room_id: &str) -> Result<Vec<(Vec<u8>, DrawingRecord, usize)>, PersistenceError> {
        let cf = self.cf()?;
        let prefix = Self::room_prefix(room_id)?;
        let mut entries = Vec::new();

        let iter = self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let (record, size) = Self::decode(&value)?;
            entries.push((key.to_vec(), record, size));
        }
        Ok(entries)
    }

    /// Existence check, create-from-payload when absent, then mutate.
    fn upsert_with<F>(&self, room_id: &str, drawing: &Drawing, action: &'static str, mutate: F) -> Result<DrawingRecord, StoreError>
    where
        F: FnOnce(&mut DrawingRecord, chrono::DateTime<Utc>),
    {
        let drawing_id = drawing.require_id(action)?;
        let _guard = self.lock();
        let now = Utc::now();

        let mut record = match self.get(room_id, drawing_id)? {
            Some(existing) => existing,
            None => {
                log::debug!("{action} for unknown drawing {drawing_id} in room {room_id}; creating from payload");
                drawing::to_record_at(room_id, drawing, now)
            }
        };
        mutate(&mut record, now);
        self.write_record(&record)?;
        Ok(record)
    }

    /// Delete `keys` in chunks of [`MAX_BATCH_SIZE`]. A rejected chunk is
    /// reported as unprocessed; later chunks still run.
    fn delete_in_batches(&self, room_id: &str, keys: Vec<(Vec<u8>, String)>, report: &mut PurgeReport) -> Result<(), PersistenceError> {
        let cf = self.cf()?;
        for chunk in keys.chunks(MAX_BATCH_SIZE) {
            let mut batch = WriteBatch::default();
            for (key, _) in chunk {
                batch.delete_cf(cf, key);
            }
            report.batch_sizes.push(chunk.len());

            match self.db.write_opt(batch, &self.write_options()) {
                Ok(()) => {
                    report.deleted += chunk.len();
                    log::info!("Deleted {} records from hot log for room {room_id}", chunk.len());
                }
                Err(e) => {
                    log::error!("Failed to process {} deletes for room {room_id}: {e}", chunk.len());
                    report.unprocessed.extend(chunk.iter().map(|(_, id)| id.clone()));
                }
            }
        }
        Ok(())
    }
}

impl HotLog for RocksHotLog {
    fn put(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, PersistenceError> {
        let _guard = self.lock();
        let mut record = drawing::to_record(room_id, drawing);
        if let Some(existing) = self.get(room_id, &record.drawing_id)? {
            record.created_at = existing.created_at;
        }
        self.write_record(&record)?;
        Ok(record)
    }

    fn get(&self, room_id: &str, drawing_id: &str) -> Result<Option<DrawingRecord>, PersistenceError> {
        let cf = self.cf()?;
        let key = Self::record_key(room_id, drawing_id)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(Self::decode(&value)?.0)),
            None => Ok(None),
        }
    }

    fn list_by_room(&self, room_id: &str) -> Result<Vec<DrawingRecord>, PersistenceError> {
        let mut records: Vec<DrawingRecord> = self.scan_room(room_id)?.into_iter().map(|(_, r, _)| r).collect();
        // Stable: same-instant records keep key order
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    fn soft_delete(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, StoreError> {
        self.upsert_with(room_id, drawing, "delete", |record, now| record.mark_deleted(now))
    }

    fn restore(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, StoreError> {
        self.upsert_with(room_id, drawing, "restore", |record, now| record.mark_restored(now))
    }

    fn apply_transform(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, StoreError> {
        self.upsert_with(room_id, drawing, "transform", |record, now| record.overwrite_from(drawing, now))
    }

    fn apply_transform_partial(&self, room_id: &str, drawing: &Drawing) -> Result<DrawingRecord, StoreError> {
        self.upsert_with(room_id, drawing, "transform", |record, now| record.patch_transform(drawing, now))
    }

    fn purge_room(&self, room_id: &str) -> Result<PurgeReport, PersistenceError> {
        let _guard = self.lock();
        let keys = self
            .scan_room(room_id)?
            .into_iter()
            .map(|(key, record, _)| (key, record.drawing_id))
            .collect();

        let mut report = PurgeReport::default();
        self.delete_in_batches(room_id, keys, &mut report)?;
        Ok(report)
    }

    fn purge_if_unchanged(&self, room_id: &str, records: &[DrawingRecord]) -> Result<PurgeReport, PersistenceError> {
        let _guard = self.lock();
        let mut report = PurgeReport::default();
        let mut keys = Vec::with_capacity(records.len());

        for merged in records {
            match self.get(room_id, &merged.drawing_id)? {
                Some(stored) if stored.updated_at == merged.updated_at => {
                    keys.push((Self::record_key(room_id, &merged.drawing_id)?, merged.drawing_id.clone()));
                }
                Some(_) => report.retained.push(merged.drawing_id.clone()),
                None => {}
            }
        }

        if !report.retained.is_empty() {
            log::info!(
                "Keeping {} records in hot log for room {room_id}: modified after compaction read",
                report.retained.len()
            );
        }
        self.delete_in_batches(room_id, keys, &mut report)?;
        Ok(report)
    }

    fn room_stats(&self, room_id: &str) -> Result<RoomStats, PersistenceError> {
        let entries = self.scan_room(room_id)?;
        Ok(RoomStats {
            count: entries.len(),
            total_size: entries.iter().map(|(_, _, size)| size).sum(),
        })
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
