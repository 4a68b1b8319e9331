//! Wire messages for the WebSocket transport.
//!
//! JSON with a `type` tag. The shapes mirror the engine types so the server
//! is mostly a forwarding layer: edits carry full content plus the expected
//! version, conflicts carry the store's current state for client-side
//! convergence.

use serde::{Deserialize, Serialize};

use crate::{CursorPosition, Document, DocumentId, EntityId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first message on a connection.
    Open {
        user_id: UserId,
        user_name: String,
        #[serde(flatten)]
        target: OpenTarget,
    },
    Edit {
        content: String,
        expected_version: u64,
    },
    Cursor {
        position: usize,
    },
    Ping,
}

/// Which document an `open` addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenTarget {
    DocumentId(DocumentId),
    LinkedEntity(EntityId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full state sent after `open` and on every committed remote write.
    Document { document: Document },
    EditAck { version: u64 },
    Conflict {
        current_version: u64,
        current_content: String,
    },
    Cursors { cursors: Vec<CursorPosition> },
    Error { message: String },
    Pong,
}
