//! Drawing domain types and the record codec.
//!
//! Two shapes of the same object:
//! ```text
//! Drawing (wire, camelCase)            DrawingRecord (persisted, snake_case)
//! ┌──────────────────────┐  to_record  ┌──────────────────────────────────┐
//! │ id?  type  points    │ ──────────► │ room_id  drawing_id  type points │
//! │ stroke strokeWidth   │             │ stroke stroke_width  x y ...     │
//! │ x y rotation scaleX… │ ◄────────── │ created_at updated_at            │
//! │ lineCap lineJoin …   │ from_record │ deleted_at is_deleted            │
//! └──────────────────────┘             └──────────────────────────────────┘
//! ```
//!
//! The record is keyed by `(room_id, drawing_id)`. A record with
//! `is_deleted = true` is a tombstone: every other field is retained until
//! compaction physically purges it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// A drawing object as exchanged with clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drawing {
    /// Client-generated id; the server assigns one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Free-form shape discriminator ("pen", "rect", ...)
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Flattened coordinate pairs
    #[serde(default)]
    pub points: Vec<f64>,
    /// Stroke color
    #[serde(default)]
    pub stroke: String,
    #[serde(default)]
    pub stroke_width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skew_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skew_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_cap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_join: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
}

impl Drawing {
    /// Id if present and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    /// Id required by an update path (`action` names the path for the error).
    pub fn require_id(&self, action: &'static str) -> Result<&str, ValidationError> {
        self.id().ok_or(ValidationError::MissingDrawingId { action })
    }

    /// True when the entry carries no geometry, i.e. only a move/resize.
    pub fn is_transform_only(&self) -> bool {
        self.points.is_empty()
    }
}

/// Persisted form of a drawing, partitioned by room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingRecord {
    pub room_id: String,
    pub drawing_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub points: Vec<f64>,
    pub stroke: String,
    pub stroke_width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skew_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skew_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_cap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_join: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

impl DrawingRecord {
    /// Not a tombstone.
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }

    /// Mark as tombstone. All other fields are kept.
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) {
        self.is_deleted = true;
        self.deleted_at = Some(now);
        self.updated_at = now;
    }

    /// Inverse of [`mark_deleted`](Self::mark_deleted).
    pub fn mark_restored(&mut self, now: DateTime<Utc>) {
        self.is_deleted = false;
        self.deleted_at = None;
        self.updated_at = now;
    }

    /// Full-field overwrite of geometry, style and transform attributes.
    pub fn overwrite_from(&mut self, drawing: &Drawing, now: DateTime<Utc>) {
        self.kind = drawing.kind.clone();
        self.points = drawing.points.clone();
        self.stroke = drawing.stroke.clone();
        self.stroke_width = drawing.stroke_width;
        self.x = drawing.x;
        self.y = drawing.y;
        self.rotation = drawing.rotation;
        self.scale_x = drawing.scale_x;
        self.scale_y = drawing.scale_y;
        self.skew_x = drawing.skew_x;
        self.skew_y = drawing.skew_y;
        self.line_cap = drawing.line_cap.clone();
        self.line_join = drawing.line_join.clone();
        self.opacity = drawing.opacity;
        self.updated_at = now;
    }

    /// Update only the transform attributes present in `drawing`.
    pub fn patch_transform(&mut self, drawing: &Drawing, now: DateTime<Utc>) {
        fn patch(slot: &mut Option<f64>, value: Option<f64>) {
            if value.is_some() {
                *slot = value;
            }
        }
        patch(&mut self.x, drawing.x);
        patch(&mut self.y, drawing.y);
        patch(&mut self.rotation, drawing.rotation);
        patch(&mut self.scale_x, drawing.scale_x);
        patch(&mut self.scale_y, drawing.scale_y);
        patch(&mut self.skew_x, drawing.skew_x);
        patch(&mut self.skew_y, drawing.skew_y);
        self.updated_at = now;
    }
}

/// A client undo/redo batch. Applied once, never persisted as itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "objects", rename_all = "lowercase")]
pub enum UndoRedoAction {
    Delete(Vec<Drawing>),
    Restore(Vec<Drawing>),
    Transform(Vec<Drawing>),
}

impl UndoRedoAction {
    pub fn drawings(&self) -> &[Drawing] {
        match self {
            UndoRedoAction::Delete(d) | UndoRedoAction::Restore(d) | UndoRedoAction::Transform(d) => d,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UndoRedoAction::Delete(_) => "delete",
            UndoRedoAction::Restore(_) => "restore",
            UndoRedoAction::Transform(_) => "transform",
        }
    }
}

// ─── Codec ────────────────────────────────────────────────────────────

/// Server-assigned id: `<epoch millis>#<uuid v4>`.
pub fn generate_drawing_id(now: DateTime<Utc>) -> String {
    format!("{}#{}", now.timestamp_millis(), Uuid::new_v4())
}

/// Encode a client drawing into its room-scoped record, stamped now.
pub fn to_record(room_id: &str, drawing: &Drawing) -> DrawingRecord {
    to_record_at(room_id, drawing, Utc::now())
}

/// Encode with an explicit clock.
pub fn to_record_at(room_id: &str, drawing: &Drawing, now: DateTime<Utc>) -> DrawingRecord {
    let drawing_id = match drawing.id() {
        Some(id) => id.to_string(),
        None => generate_drawing_id(now),
    };

    DrawingRecord {
        room_id: room_id.to_string(),
        drawing_id,
        kind: drawing.kind.clone(),
        points: drawing.points.clone(),
        stroke: drawing.stroke.clone(),
        stroke_width: drawing.stroke_width,
        x: drawing.x,
        y: drawing.y,
        rotation: drawing.rotation,
        scale_x: drawing.scale_x,
        scale_y: drawing.scale_y,
        skew_x: drawing.skew_x,
        skew_y: drawing.skew_y,
        line_cap: drawing.line_cap.clone(),
        line_join: drawing.line_join.clone(),
        opacity: drawing.opacity,
        created_at: now,
        updated_at: now,
        deleted_at: None,
        is_deleted: false,
    }
}

/// Decode a record back to the client shape, dropping persistence-only fields.
pub fn from_record(record: &DrawingRecord) -> Drawing {
    Drawing {
        id: Some(record.drawing_id.clone()),
        kind: record.kind.clone(),
        points: record.points.clone(),
        stroke: record.stroke.clone(),
        stroke_width: record.stroke_width,
        x: record.x,
        y: record.y,
        rotation: record.rotation,
        scale_x: record.scale_x,
        scale_y: record.scale_y,
        skew_x: record.skew_x,
        skew_y: record.skew_y,
        line_cap: record.line_cap.clone(),
        line_join: record.line_join.clone(),
        opacity: record.opacity,
    }
}
