//! Error taxonomy for the drawing log engine.
//!
//! - [`PersistenceError`]: backend unreachable or a write was rejected
//! - [`ValidationError`]: an update/undo/redo target is missing its id
//! - [`SnapshotFormatError`]: a cold snapshot body failed schema validation
//!
//! Storage failures never reach clients: the fan-out boundary and the
//! compactor log them and carry on.

use thiserror::Error;

/// Hot log / cold store backend failures.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    /// Filesystem / object I/O error
    #[error("I/O error: {0}")]
    Io(String),
    /// Record or snapshot could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Stored record could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    /// LZ4 block was corrupt
    #[error("Compression error: {0}")]
    Compression(String),
    /// Room or object key cannot be mapped onto the backend
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    /// Object already exists and must not be overwritten
    #[error("Object already exists: {0}")]
    AlreadyExists(String),
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        PersistenceError::Io(e.to_string())
    }
}

/// Rejected client input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// An update, undo or redo entry arrived without a drawing id
    #[error("Drawing ID is required for {action}")]
    MissingDrawingId { action: &'static str },
}

/// A cold snapshot object that does not match `{roomId, timestamp, drawingsCount, drawings}`.
#[derive(Debug, Clone, Error)]
#[error("Invalid snapshot data structure for {key}: {reason}")]
pub struct SnapshotFormatError {
    pub key: String,
    pub reason: String,
}

/// Errors surfaced by hot log operations that take a client payload.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
