//! Real-time channel events.
//!
//! Every WebSocket text frame is one JSON object:
//! ```text
//! { "event": "<name>", "data": <payload> }
//! ```
//!
//! | client → server | server → client |
//! |---|---|
//! | `join { roomId }` | `roomData [Drawing]` (joiner only) |
//! |  | `userEntered "<connection id>"` (others) |
//! | `drawing { roomId, drawings }` | `drawing` (others) |
//! | `drawingEnd { roomId, drawing }` | `drawingEnd` (others) |
//! | `transform { roomId, drawings }` | `transform` (others) |
//! | `remove { roomId, drawings }` | `remove` (others) |
//! | `undo { roomId, undoResult }` | `undoDrawings` (others) |
//! | `redo { roomId, redoResult }` | `redoDrawings` (others) |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::drawing::{Drawing, UndoRedoAction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room_id: String,
}

/// Payload of `drawing`, `transform` and `remove`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingsPayload {
    pub room_id: String,
    pub drawings: Vec<Drawing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingEndPayload {
    pub room_id: String,
    pub drawing: Drawing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoPayload {
    pub room_id: String,
    pub undo_result: UndoRedoAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedoPayload {
    pub room_id: String,
    pub redo_result: UndoRedoAction,
}

/// Events a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    Join(JoinPayload),
    Drawing(DrawingsPayload),
    DrawingEnd(DrawingEndPayload),
    Transform(DrawingsPayload),
    Remove(DrawingsPayload),
    Undo(UndoPayload),
    Redo(RedoPayload),
}

/// Events the server emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Merged room state for a joining client
    RoomData(Vec<Drawing>),
    /// Connection id of a newly joined peer
    UserEntered(String),
    Drawing(DrawingsPayload),
    DrawingEnd(DrawingEndPayload),
    Transform(DrawingsPayload),
    Remove(DrawingsPayload),
    UndoDrawings(UndoPayload),
    RedoDrawings(RedoPayload),
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Room the event targets.
    pub fn room_id(&self) -> &str {
        match self {
            ClientEvent::Join(p) => &p.room_id,
            ClientEvent::Drawing(p) | ClientEvent::Transform(p) | ClientEvent::Remove(p) => &p.room_id,
            ClientEvent::DrawingEnd(p) => &p.room_id,
            ClientEvent::Undo(p) => &p.room_id,
            ClientEvent::Redo(p) => &p.room_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "join",
            ClientEvent::Drawing(_) => "drawing",
            ClientEvent::DrawingEnd(_) => "drawingEnd",
            ClientEvent::Transform(_) => "transform",
            ClientEvent::Remove(_) => "remove",
            ClientEvent::Undo(_) => "undo",
            ClientEvent::Redo(_) => "redo",
        }
    }
}

impl ServerEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::RoomData(_) => "roomData",
            ServerEvent::UserEntered(_) => "userEntered",
            ServerEvent::Drawing(_) => "drawing",
            ServerEvent::DrawingEnd(_) => "drawingEnd",
            ServerEvent::Transform(_) => "transform",
            ServerEvent::Remove(_) => "remove",
            ServerEvent::UndoDrawings(_) => "undoDrawings",
            ServerEvent::RedoDrawings(_) => "redoDrawings",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_join() {
        let event = ClientEvent::decode(r#"{"event":"join","data":{"roomId":"r1"}}"#).unwrap();
        assert_eq!(event, ClientEvent::Join(JoinPayload { room_id: "r1".into() }));
        assert_eq!(event.room_id(), "r1");
        assert_eq!(event.name(), "join");
    }

    #[test]
    fn test_decode_drawing_end() {
        let event = ClientEvent::decode(
            r##"{"event":"drawingEnd","data":{"roomId":"r1","drawing":{"id":"p1","type":"pen","points":[1,2,3,4],"stroke":"#333","strokeWidth":4}}}"##,
        )
        .unwrap();
        let ClientEvent::DrawingEnd(payload) = event else {
            panic!("wrong variant");
        };
        assert_eq!(payload.drawing.id(), Some("p1"));
        assert_eq!(payload.drawing.stroke_width, 4.0);
    }

    #[test]
    fn test_decode_undo() {
        let event = ClientEvent::decode(
            r#"{"event":"undo","data":{"roomId":"r1","undoResult":{"action":"delete","objects":[{"id":"p1"}]}}}"#,
        )
        .unwrap();
        let ClientEvent::Undo(payload) = event else {
            panic!("wrong variant");
        };
        assert_eq!(payload.undo_result.name(), "delete");
    }

    #[test]
    fn test_server_event_names_on_the_wire() {
        let payload = UndoPayload {
            room_id: "r1".into(),
            undo_result: UndoRedoAction::Restore(vec![]),
        };
        let events = [
            ServerEvent::RoomData(vec![]),
            ServerEvent::UserEntered("c1".into()),
            ServerEvent::UndoDrawings(payload.clone()),
            ServerEvent::RedoDrawings(RedoPayload {
                room_id: "r1".into(),
                redo_result: payload.undo_result.clone(),
            }),
        ];
        for event in events {
            let json: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    #[test]
    fn test_room_data_is_a_bare_array() {
        let json = ServerEvent::RoomData(vec![Drawing { id: Some("a".into()), ..Drawing::default() }])
            .encode()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["data"][0]["id"], "a");
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        assert!(matches!(
            ClientEvent::decode(r#"{"event":"explode","data":{}}"#),
            Err(ProtocolError::Decode(_))
        ));
        assert!(ClientEvent::decode("not json").is_err());
        assert!(ClientEvent::decode(r#"{"event":"join","data":{}}"#).is_err());
    }
}
