//! # whiteboard-collab: real-time collaborative whiteboard engine
//!
//! Clients join a room over WebSocket, stream drawing edits to each other,
//! and late joiners receive the room's current state. Edits land in a hot
//! log that is periodically compacted into immutable cold snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON events    ┌──────────────────┐   fan-out   ┌──────────────┐
//! │ client      │ ◄──────────────► │ RoomSession      │ ──────────► │ Broadcaster  │
//! │ (browser)   │                  │ (per connection) │             │ local / relay│
//! └─────────────┘                  └────────┬─────────┘             └──────────────┘
//!                                           │ enqueue (after broadcast)
//!                                           ▼
//!                                  ┌──────────────────┐  check   ┌──────────────┐
//!                                  │ RoomWriters      │ ───────► │ Compactor    │
//!                                  │ (per room)       │          └──┬────────┬──┘
//!                                  └────────┬─────────┘             │        │
//!                                           ▼                       ▼        ▼
//!                                  ┌──────────────────┐   ┌──────────────────┐
//!                                  │ HotLog (RocksDB) │   │ SnapshotStore    │
//!                                  └──────────────────┘   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`drawing`]: drawing types and the record codec
//! - [`storage`]: hot log and cold snapshot stores
//! - [`compaction`]: hot-to-cold compaction and the merge rule
//! - [`broadcast`] / [`relay`]: room fan-out, in process and across processes
//! - [`writer`]: per-room sequential persistence, local or on the relay hub
//! - [`undo`]: undo/redo relay and application
//! - [`session`]: per-connection room state machine
//! - [`protocol`]: wire events
//! - [`server`]: WebSocket transport

pub mod auth;
pub mod broadcast;
pub mod compaction;
pub mod config;
pub mod drawing;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod storage;
pub mod undo;
pub mod writer;

// Re-exports for convenience
pub use auth::{AllowAll, Authenticator, Credentials, StaticTokens};
pub use broadcast::{
    BroadcastError, BroadcastStats, Broadcaster, ConnectionId, Delivery, Envelope, LocalBroadcaster, Subscription,
};
pub use compaction::{merge_drawings, CompactionOutcome, CompactionPolicy, CompactionStats, Compactor};
pub use config::WhiteboardConfig;
pub use drawing::{from_record, to_record, Drawing, DrawingRecord, UndoRedoAction};
pub use error::{PersistenceError, SnapshotFormatError, StoreError, ValidationError};
pub use protocol::{ClientEvent, ProtocolError, ServerEvent};
pub use relay::{RelayBroadcaster, RelayConfig, RelayHub, RelayLink, RelayStore};
pub use server::{ServerConfig, ServerStats, WhiteboardServer};
pub use session::{RoomSession, SessionState, WhiteboardService};
pub use storage::{
    FsSnapshotStore, HotLog, PurgeReport, RocksHotLog, RoomStats, Snapshot, SnapshotConfig, SnapshotStore,
    StoreConfig,
};
pub use undo::{ApplyReport, UndoRedoCoordinator};
pub use writer::{PersistJob, RoomStore, RoomWriters};
